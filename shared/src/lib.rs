pub use anyhow::Error;
use std::{
    fs::{self, File, Permissions},
    io,
    os::unix::fs::PermissionsExt,
    path::Path,
    time::Duration,
};

pub mod cli;
pub mod hooks;
pub mod types;

pub use types::*;

/// Keepalive written into every spoke's hub peer entry.
pub const PERSISTENT_KEEPALIVE_INTERVAL_SECS: u16 = 25;

/// Environment variable selecting the datastore file.
pub const WGF_DB_ENV: &str = "WGF_DB";

/// Cached network status goes stale after this long.
pub const NETWORK_STATUS_TTL: Duration = Duration::from_secs(5 * 60);
/// Cached peer listings go stale after this long.
pub const PEER_LIST_TTL: Duration = Duration::from_secs(60);
/// Bandwidth aggregates go stale after this long.
pub const BANDWIDTH_TTL: Duration = Duration::from_secs(60 * 60);

pub fn ensure_dirs_exist(dirs: &[&Path]) -> Result<(), io::Error> {
    for dir in dirs {
        match fs::create_dir(dir) {
            Ok(()) => {
                log::debug!("created dir {}", dir.to_string_lossy());
                fs::set_permissions(dir, Permissions::from_mode(0o700))?;
            },
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn_on_dangerous_mode(dir)?;
            },
            Err(e) => {
                return Err(e);
            },
        }
    }
    Ok(())
}

pub fn warn_on_dangerous_mode(path: &Path) -> Result<(), io::Error> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o007 != 0 {
        log::warn!(
            "{} is world-accessible (mode is {:#05o}). This is probably not what you want.",
            path.to_string_lossy(),
            mode
        );
    }
    Ok(())
}

/// Updates the permissions of a file. Returns `Ok(true)` if permissions had
/// to be changed, `Ok(false)` if they were already correct.
pub fn chmod(file: &File, new_mode: u32) -> Result<bool, io::Error> {
    let metadata = file.metadata()?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode() & 0o777;
    let updated = if mode != new_mode {
        permissions.set_mode(new_mode);
        file.set_permissions(permissions)?;
        true
    } else {
        false
    };

    Ok(updated)
}

/// Shortens secret material for logs and error messages. Base64 keys,
/// preshared keys and passphrases all go through here before display.
pub fn redact(secret: &str) -> String {
    if secret.len() <= 8 {
        "…".to_string()
    } else {
        format!("{}…", &secret[..6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_keeps_only_a_prefix() {
        assert_eq!(redact("SGb+ojrRNDuMePufwtIYhXzA"), "SGb+oj…");
        assert_eq!(redact("short"), "…");
    }
}
