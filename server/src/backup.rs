//! Local backup bundles: a copy of the database (and `fleet.toml` when
//! present) under `backups/<timestamp>/`, with a SHA-256 manifest.
//! `verify` recomputes every digest; `restore` refuses to touch anything
//! until the bundle verifies.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Datastore, Error, CONFIG_FILE, DATABASE_FILE};

#[derive(Debug, Deserialize, Serialize)]
pub struct Manifest {
    pub created_at: String,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ManifestEntry {
    pub name: String,
    pub sha256: String,
}

const MANIFEST_FILE: &str = "manifest.json";

fn sha256_file(path: &Path) -> Result<String, Error> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Creates a bundle and returns its directory.
pub fn create(store: &Datastore) -> Result<PathBuf, Error> {
    let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    let mut bundle = store.backups_dir().join(&stamp);
    let mut n = 1;
    while bundle.exists() {
        n += 1;
        bundle = store.backups_dir().join(format!("{stamp}-{n}"));
    }
    fs::create_dir_all(&bundle)?;

    let mut entries = Vec::new();
    for name in [DATABASE_FILE, CONFIG_FILE] {
        let source = store.root().join(name);
        if !source.exists() {
            continue;
        }
        let dest = bundle.join(name);
        fs::copy(&source, &dest)?;
        entries.push(ManifestEntry {
            name: name.to_string(),
            sha256: sha256_file(&dest)?,
        });
    }
    if entries.is_empty() {
        return Err(Error::not_found("datastore", store.root().display().to_string()));
    }

    let manifest = Manifest {
        created_at: Utc::now().to_rfc3339(),
        files: entries,
    };
    fs::write(
        bundle.join(MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::Fatal(format!("manifest serialization failed: {e}")))?,
    )?;
    log::info!("backup bundle written to {}", bundle.display());
    Ok(bundle)
}

/// Recomputes every digest in the bundle's manifest.
pub fn verify(bundle: &Path) -> Result<Manifest, Error> {
    let manifest_path = bundle.join(MANIFEST_FILE);
    let manifest: Manifest = serde_json::from_str(&fs::read_to_string(&manifest_path)?)
        .map_err(|e| Error::validation("manifest", e.to_string()))?;
    for entry in &manifest.files {
        let path = bundle.join(&entry.name);
        let actual = sha256_file(&path)?;
        if actual != entry.sha256 {
            return Err(Error::Integrity {
                entry_id: 0,
                expected: entry.sha256.clone(),
                actual,
            });
        }
    }
    Ok(manifest)
}

/// Restores a verified bundle into the datastore. The current database is
/// kept next to itself as `wireguard.db.pre-restore.<timestamp>`.
pub fn restore(store: &Datastore, bundle: &Path) -> Result<(), Error> {
    verify(bundle)?;
    let db_path = store.database_path();
    if db_path.exists() {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let aside = PathBuf::from(format!("{}.pre-restore.{stamp}", db_path.display()));
        fs::rename(&db_path, &aside)?;
        log::info!("previous database kept at {}", aside.display());
    }
    for name in [DATABASE_FILE, CONFIG_FILE] {
        let source = bundle.join(name);
        if source.exists() {
            fs::copy(&source, store.root().join(name))?;
        }
    }
    Ok(())
}

/// Bundles under `backups/`, newest last.
pub fn list(store: &Datastore) -> Result<Vec<PathBuf>, Error> {
    let dir = store.backups_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut bundles: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.join(MANIFEST_FILE).exists())
        .collect();
    bundles.sort();
    Ok(bundles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_db(content: &[u8]) -> (tempfile::TempDir, Datastore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Datastore::new(dir.path().to_path_buf());
        fs::create_dir_all(store.backups_dir()).unwrap();
        fs::write(store.database_path(), content).unwrap();
        (dir, store)
    }

    #[test]
    fn bundle_round_trip() {
        let (_dir, store) = store_with_db(b"not really sqlite");
        let bundle = create(&store).unwrap();
        verify(&bundle).unwrap();

        fs::write(store.database_path(), b"changed after backup").unwrap();
        restore(&store, &bundle).unwrap();
        assert_eq!(fs::read(store.database_path()).unwrap(), b"not really sqlite");
    }

    #[test]
    fn tampered_bundle_is_refused() {
        let (_dir, store) = store_with_db(b"original");
        let bundle = create(&store).unwrap();
        fs::write(bundle.join(DATABASE_FILE), b"tampered").unwrap();
        assert!(matches!(verify(&bundle), Err(Error::Integrity { .. })));
        assert!(matches!(
            restore(&store, &bundle),
            Err(Error::Integrity { .. })
        ));
    }

    #[test]
    fn restore_keeps_the_old_database_aside() {
        let (_dir, store) = store_with_db(b"v1");
        let bundle = create(&store).unwrap();
        fs::write(store.database_path(), b"v2").unwrap();
        restore(&store, &bundle).unwrap();

        let aside: Vec<_> = fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .contains(".pre-restore.")
            })
            .collect();
        assert_eq!(aside.len(), 1);
        assert_eq!(fs::read(aside[0].path()).unwrap(), b"v2");
    }
}
