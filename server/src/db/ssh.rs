use std::{
    ops::{Deref, DerefMut},
    path::PathBuf,
};

use rusqlite::{params, Connection, OptionalExtension};
use wgfleet_shared::{SshHost, SshHostContents};

use crate::Error;

/// Shared SSH deployment hosts. Deleting one never cascades: referencing
/// entities fall back to SSH-less via ON DELETE SET NULL.
#[derive(Debug)]
pub struct DatabaseSshHost {
    pub inner: SshHost,
}

impl From<SshHost> for DatabaseSshHost {
    fn from(inner: SshHost) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseSshHost {
    type Target = SshHost;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseSshHost {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseSshHost {
    pub fn create(conn: &Connection, contents: SshHostContents) -> Result<Self, Error> {
        log::debug!("creating ssh host {}", contents.name);
        conn.execute(
            "INSERT INTO ssh_hosts (name, host, port, user, key_path, config_dir)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                contents.name,
                contents.host,
                contents.port,
                contents.user,
                contents
                    .key_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
                contents.config_dir.to_string_lossy().to_string(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(SshHost { id, contents }.into())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(SshHost {
            id: row.get(0)?,
            contents: SshHostContents {
                name: row.get(1)?,
                host: row.get(2)?,
                port: row.get(3)?,
                user: row.get(4)?,
                key_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
                config_dir: PathBuf::from(row.get::<_, String>(6)?),
            },
        }
        .into())
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Self, Error> {
        Ok(conn.query_row(
            "SELECT id, name, host, port, user, key_path, config_dir FROM ssh_hosts WHERE id = ?1",
            params![id],
            Self::from_row,
        )?)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Self, Error> {
        conn.query_row(
            "SELECT id, name, host, port, user, key_path, config_dir FROM ssh_hosts WHERE name = ?1",
            params![name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("ssh host", name))
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, host, port, user, key_path, config_dir FROM ssh_hosts ORDER BY name",
        )?;
        let hosts = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(hosts)
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
        match conn.execute("DELETE FROM ssh_hosts WHERE id = ?1", params![id])? {
            0 => Err(Error::not_found("ssh host", id.to_string())),
            _ => Ok(()),
        }
    }
}
