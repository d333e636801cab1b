//! Placing generated configs on their hosts.
//!
//! A target is (host, path, interface). Local targets (loopback, our own
//! hostname) are written directly; remote targets go through the system
//! `ssh`/`scp` binaries so the operator's agent, config and known_hosts all
//! apply. Every deployment follows the same sequence: backup, atomic
//! write, permissions, optional restart, verification. Nothing is ever
//! rolled back automatically; the backup is the operator's undo.

use std::{
    fmt,
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Output},
    time::Duration,
};

use chrono::Utc;
use wgfleet_shared::SshHost;

use crate::Error;

/// Where in the sequence a deployment failed. Each stage is a distinct
/// failure kind with its own operator remedy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeployStage {
    Connect,
    Auth,
    Backup,
    Write,
    Permission,
    Restart,
    Verify,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Connect => "connect",
            DeployStage::Auth => "auth",
            DeployStage::Backup => "backup",
            DeployStage::Write => "write",
            DeployStage::Permission => "permission",
            DeployStage::Restart => "restart",
            DeployStage::Verify => "verify",
        }
    }
}

#[derive(Debug)]
pub struct DeployError {
    pub stage: DeployStage,
    pub message: String,
}

impl fmt::Display for DeployError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deploy {} failure: {}", self.stage.as_str(), self.message)
    }
}

impl std::error::Error for DeployError {}

impl DeployError {
    fn at(stage: DeployStage, message: impl Into<String>) -> Self {
        DeployError {
            stage,
            message: message.into(),
        }
    }
}

impl From<DeployError> for Error {
    fn from(e: DeployError) -> Self {
        match e.stage {
            DeployStage::Connect | DeployStage::Restart | DeployStage::Verify => {
                Error::Network(e.to_string())
            },
            DeployStage::Auth => Error::Auth(e.to_string()),
            DeployStage::Backup | DeployStage::Write | DeployStage::Permission => {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            },
        }
    }
}

/// One deployment destination.
#[derive(Clone, Debug)]
pub struct DeployTarget {
    pub label: String,
    /// `None` deploys on this machine.
    pub ssh: Option<SshHost>,
    pub path: PathBuf,
    pub interface: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeployOptions {
    pub restart: bool,
    pub verify: bool,
    pub dry_run: bool,
}

#[derive(Clone, Debug, Default)]
pub struct DeployReport {
    pub backup_path: Option<String>,
    pub changed: bool,
    pub restarted: bool,
    pub verified: bool,
}

/// Whether a configured host is actually this machine.
pub fn is_local_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    if let Ok(addr) = host.parse::<std::net::IpAddr>() {
        return addr.is_loopback();
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|local| local == host)
        .unwrap_or(false)
}

/// Deploys one rendered config. The caller journals the outcome.
pub fn deploy(
    target: &DeployTarget,
    content: &str,
    expected_public_key: &str,
    options: DeployOptions,
) -> Result<DeployReport, DeployError> {
    if options.dry_run {
        log::info!(
            "dry-run: would deploy {} bytes to {} ({})",
            content.len(),
            target.label,
            target.path.display()
        );
        return Ok(DeployReport::default());
    }
    match &target.ssh {
        Some(ssh) if !is_local_host(&ssh.host) => {
            deploy_remote(target, ssh, content, expected_public_key, options)
        },
        _ => deploy_local(target, content, expected_public_key, options),
    }
}

fn backup_name(path: &Path, exists: impl Fn(&Path) -> bool) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    backup_name_with_stamp(path, &stamp, exists)
}

fn backup_name_with_stamp(
    path: &Path,
    stamp: &str,
    exists: impl Fn(&Path) -> bool,
) -> PathBuf {
    let base = PathBuf::from(format!("{}.backup.{stamp}", path.display()));
    if !exists(&base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = PathBuf::from(format!("{}-{n}", base.display()));
        if !exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn deploy_local(
    target: &DeployTarget,
    content: &str,
    expected_public_key: &str,
    options: DeployOptions,
) -> Result<DeployReport, DeployError> {
    let mut report = DeployReport::default();
    let path = &target.path;
    let dir = path
        .parent()
        .ok_or_else(|| DeployError::at(DeployStage::Write, "target path has no parent"))?;
    fs::create_dir_all(dir).map_err(|e| classify_io(DeployStage::Write, &e))?;

    let previous = match fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(classify_io(DeployStage::Backup, &e)),
    };
    report.changed = previous.as_deref() != Some(content);

    if previous.is_some() {
        let backup = backup_name(path, |p| p.exists());
        fs::copy(path, &backup).map_err(|e| classify_io(DeployStage::Backup, &e))?;
        report.backup_path = Some(backup.display().to_string());
    }

    let mut temp = tempfile::Builder::new()
        .prefix(".wgfleet-")
        .tempfile_in(dir)
        .map_err(|e| classify_io(DeployStage::Write, &e))?;
    temp.write_all(content.as_bytes())
        .map_err(|e| classify_io(DeployStage::Write, &e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| classify_io(DeployStage::Write, &e))?;
    wgfleet_shared::chmod(temp.as_file(), 0o600)
        .map_err(|e| classify_io(DeployStage::Permission, &e))?;
    temp.persist(path)
        .map_err(|e| classify_io(DeployStage::Write, &e.error))?;

    if options.restart {
        if unsafe { libc::geteuid() } != 0 {
            return Err(DeployError::at(
                DeployStage::Permission,
                "restarting an interface requires root",
            ));
        }
        // Sequence mirrors the operator's own hands: down, then up.
        let down = Command::new("wg-quick")
            .args(["down", &target.interface])
            .output();
        if let Err(e) = down {
            log::warn!("wg-quick down {} failed: {e}", target.interface);
        }
        let up = Command::new("wg-quick")
            .args(["up", &target.interface])
            .output()
            .map_err(|e| DeployError::at(DeployStage::Restart, e.to_string()))?;
        if !up.status.success() {
            return Err(DeployError::at(
                DeployStage::Restart,
                String::from_utf8_lossy(&up.stderr).trim().to_string(),
            ));
        }
        report.restarted = true;
    }

    if options.verify {
        let output = Command::new("wg")
            .args(["show", &target.interface, "public-key"])
            .output()
            .map_err(|e| DeployError::at(DeployStage::Verify, e.to_string()))?;
        verify_output(&output, expected_public_key)?;
        report.verified = true;
    }

    Ok(report)
}

fn classify_io(stage: DeployStage, e: &std::io::Error) -> DeployError {
    let stage = if e.kind() == std::io::ErrorKind::PermissionDenied {
        DeployStage::Permission
    } else {
        stage
    };
    DeployError::at(stage, e.to_string())
}

fn verify_output(output: &Output, expected: &str) -> Result<(), DeployError> {
    if !output.status.success() {
        return Err(DeployError::at(
            DeployStage::Verify,
            format!(
                "interface not present: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    let reported = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if reported != expected {
        return Err(DeployError::at(
            DeployStage::Verify,
            format!(
                "interface reports key {}, expected {}",
                wgfleet_shared::redact(&reported),
                wgfleet_shared::redact(expected)
            ),
        ));
    }
    Ok(())
}

fn ssh_base(ssh: &SshHost) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"]);
    cmd.args(["-p", &ssh.port.to_string()]);
    if let Some(key) = &ssh.key_path {
        cmd.arg("-i").arg(key);
    }
    cmd.arg(format!("{}@{}", ssh.user, ssh.host));
    cmd
}

fn ssh_run(ssh: &SshHost, remote_command: &str) -> Result<Output, DeployError> {
    let output = ssh_base(ssh)
        .arg(remote_command)
        .output()
        .map_err(|e| DeployError::at(DeployStage::Connect, e.to_string()))?;
    if output.status.code() == Some(255) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stage = if stderr.contains("Permission denied") || stderr.contains("Authentication")
        {
            DeployStage::Auth
        } else {
            DeployStage::Connect
        };
        return Err(DeployError::at(stage, stderr.trim().to_string()));
    }
    Ok(output)
}

fn remote_file_exists(ssh: &SshHost, path: &str) -> Result<bool, DeployError> {
    let output = ssh_run(ssh, &format!("test -e {}", shell_quote(path)))?;
    Ok(output.status.success())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn deploy_remote(
    target: &DeployTarget,
    ssh: &SshHost,
    content: &str,
    expected_public_key: &str,
    options: DeployOptions,
) -> Result<DeployReport, DeployError> {
    let mut report = DeployReport::default();
    let path = target.path.display().to_string();
    let quoted = shell_quote(&path);

    // One cheap command up front separates unreachable-host and bad-auth
    // from everything later.
    ssh_run(ssh, "true")?;

    let dir = target
        .path
        .parent()
        .map(|d| d.display().to_string())
        .unwrap_or_else(|| ".".to_string());
    let mkdir = ssh_run(ssh, &format!("mkdir -p {}", shell_quote(&dir)))?;
    if !mkdir.status.success() {
        return Err(DeployError::at(
            DeployStage::Write,
            String::from_utf8_lossy(&mkdir.stderr).trim().to_string(),
        ));
    }

    let exists = remote_file_exists(ssh, &path)?;
    if exists {
        let current = ssh_run(ssh, &format!("cat {quoted}"))?;
        report.changed = String::from_utf8_lossy(&current.stdout) != content;
        let backup = backup_name(&target.path, |candidate| {
            remote_file_exists(ssh, &candidate.display().to_string()).unwrap_or(false)
        });
        let copy = ssh_run(
            ssh,
            &format!(
                "cp -p {quoted} {}",
                shell_quote(&backup.display().to_string())
            ),
        )?;
        if !copy.status.success() {
            return Err(DeployError::at(
                DeployStage::Backup,
                String::from_utf8_lossy(&copy.stderr).trim().to_string(),
            ));
        }
        report.backup_path = Some(backup.display().to_string());
    } else {
        report.changed = true;
    }

    // scp to a temp name in the same directory, then rename; the rename is
    // what makes the swap atomic.
    let staged = format!("{path}.wgfleet-staged");
    let mut local_temp = tempfile::NamedTempFile::new()
        .map_err(|e| classify_io(DeployStage::Write, &e))?;
    local_temp
        .write_all(content.as_bytes())
        .map_err(|e| classify_io(DeployStage::Write, &e))?;
    local_temp
        .flush()
        .map_err(|e| classify_io(DeployStage::Write, &e))?;

    let mut scp = Command::new("scp");
    scp.args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"]);
    scp.args(["-P", &ssh.port.to_string()]);
    if let Some(key) = &ssh.key_path {
        scp.arg("-i").arg(key);
    }
    scp.arg(local_temp.path());
    scp.arg(format!("{}@{}:{}", ssh.user, ssh.host, staged));
    let scp_out = scp
        .output()
        .map_err(|e| DeployError::at(DeployStage::Connect, e.to_string()))?;
    if !scp_out.status.success() {
        return Err(DeployError::at(
            DeployStage::Write,
            String::from_utf8_lossy(&scp_out.stderr).trim().to_string(),
        ));
    }

    let finalize = ssh_run(
        ssh,
        &format!(
            "chmod 600 {staged_q} && mv {staged_q} {quoted}",
            staged_q = shell_quote(&staged)
        ),
    )?;
    if !finalize.status.success() {
        return Err(DeployError::at(
            DeployStage::Permission,
            String::from_utf8_lossy(&finalize.stderr).trim().to_string(),
        ));
    }

    if options.restart {
        let restart = ssh_run(
            ssh,
            &format!(
                "wg-quick down {iface} ; wg-quick up {iface}",
                iface = shell_quote(&target.interface)
            ),
        )?;
        if !restart.status.success() {
            return Err(DeployError::at(
                DeployStage::Restart,
                String::from_utf8_lossy(&restart.stderr).trim().to_string(),
            ));
        }
        report.restarted = true;
    }

    if options.verify {
        let show = ssh_run(
            ssh,
            &format!("wg show {} public-key", shell_quote(&target.interface)),
        )?;
        verify_output(&show, expected_public_key)?;
        report.verified = true;
    }

    Ok(report)
}

/// SSH reachability check used by `ssh-setup`.
pub fn check_ssh_host(ssh: &SshHost, _deadline: Duration) -> Result<(), Error> {
    ssh_run(ssh, "true").map(|_| ()).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn local_deploy_backs_up_sets_mode_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-hub.conf");
        let target = DeployTarget {
            label: "hub".to_string(),
            ssh: None,
            path: path.clone(),
            interface: "wg-hub".to_string(),
        };
        let options = DeployOptions::default();

        let report = deploy(&target, "[Interface]\n", "PK", options).unwrap();
        assert!(report.backup_path.is_none());
        assert!(report.changed);
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Interface]\n");

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        // Second deploy of different content: backup of the old content
        // exists afterwards.
        let report = deploy(&target, "[Interface]\n# v2\n", "PK", options).unwrap();
        let backup = report.backup_path.expect("backup should exist");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "[Interface]\n");
        assert!(report.changed);

        // Redeploying unchanged content is a no-op apart from the backup.
        let report = deploy(&target, "[Interface]\n# v2\n", "PK", options).unwrap();
        assert!(!report.changed);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "[Interface]\n# v2\n"
        );
    }

    #[test]
    fn backup_names_get_monotonic_suffixes_on_collision() {
        let path = PathBuf::from("/tmp/wg0.conf");
        let first = backup_name_with_stamp(&path, "20260801120000", |_| false);
        assert_eq!(
            first.display().to_string(),
            "/tmp/wg0.conf.backup.20260801120000"
        );

        let mut seen = HashSet::new();
        seen.insert(first.display().to_string());
        seen.insert(format!("{}-1", first.display()));
        let third = backup_name_with_stamp(&path, "20260801120000", |p| {
            seen.contains(&p.display().to_string())
        });
        assert_eq!(third.display().to_string(), format!("{}-2", first.display()));
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0.conf");
        let target = DeployTarget {
            label: "hub".to_string(),
            ssh: None,
            path: path.clone(),
            interface: "wg0".to_string(),
        };
        deploy(
            &target,
            "[Interface]\n",
            "PK",
            DeployOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn local_hosts_are_recognized() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("::1"));
        assert!(!is_local_host("203.0.113.9"));
    }
}
