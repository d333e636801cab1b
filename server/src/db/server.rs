use std::{
    net::IpAddr,
    ops::{Deref, DerefMut},
};

use rusqlite::{params, Connection, OptionalExtension};
use wgfleet_conf::KeyPair;
use wgfleet_shared::{Server, ServerContents};

use super::DatabaseRotation;
use crate::{vault::Vault, Error};

/// The coordination server row. Exactly one per datastore in the default
/// topology.
#[derive(Debug)]
pub struct DatabaseServer {
    pub inner: Server,
}

impl From<Server> for DatabaseServer {
    fn from(inner: Server) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseServer {
    type Target = Server;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseServer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseServer {
    /// Persists the hub. `permanent_guid` is frozen to the first public key
    /// observed here, whatever later rotations do.
    pub fn create(
        conn: &Connection,
        vault: &Vault,
        mut contents: ServerContents,
        private_key: &str,
    ) -> Result<Self, Error> {
        if contents.ipv4_cidr.is_none() && contents.ipv6_cidr.is_none() {
            return Err(Error::validation(
                "cidr",
                "the hub needs a v4 or v6 network range (or both)",
            ));
        }
        if Self::get_opt(conn)?.is_some() {
            return Err(Error::Conflict(
                "datastore already has a coordination server".to_string(),
            ));
        }
        contents.permanent_guid = contents.public_key.clone();
        log::info!("creating coordination server {}", contents.hostname);

        conn.execute(
            "INSERT INTO servers
               (hostname, endpoint, ipv4_cidr, ipv6_cidr, ipv4_addr, ipv6_addr,
                public_key, private_key, permanent_guid, listen_port, mtu, ssh_host_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                &*contents.hostname,
                contents.endpoint.to_string(),
                contents.ipv4_cidr.map(|c| c.to_string()),
                contents.ipv6_cidr.map(|c| c.to_string()),
                contents.ipv4_addr.map(|a| a.to_string()),
                contents.ipv6_addr.map(|a| a.to_string()),
                contents.public_key,
                vault.seal(private_key)?,
                contents.permanent_guid,
                contents.listen_port,
                contents.mtu,
                contents.ssh_host_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Server { id, contents }.into())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        let parse_err = |_| rusqlite::Error::ExecuteReturnedResults;
        Ok(Server {
            id: row.get(0)?,
            contents: ServerContents {
                hostname: row.get::<_, String>(1)?.parse().map_err(parse_err)?,
                endpoint: row.get::<_, String>(2)?.parse().map_err(parse_err)?,
                ipv4_cidr: row
                    .get::<_, Option<String>>(3)?
                    .and_then(|s| s.parse().ok()),
                ipv6_cidr: row
                    .get::<_, Option<String>>(4)?
                    .and_then(|s| s.parse().ok()),
                ipv4_addr: row
                    .get::<_, Option<String>>(5)?
                    .and_then(|s| s.parse().ok()),
                ipv6_addr: row
                    .get::<_, Option<String>>(6)?
                    .and_then(|s| s.parse().ok()),
                public_key: row.get(7)?,
                permanent_guid: row.get(8)?,
                listen_port: row.get(9)?,
                mtu: row.get(10)?,
                ssh_host_id: row.get(11)?,
            },
        }
        .into())
    }

    const SELECT: &'static str = "SELECT id, hostname, endpoint, ipv4_cidr, ipv6_cidr,
        ipv4_addr, ipv6_addr, public_key, permanent_guid, listen_port, mtu, ssh_host_id
        FROM servers";

    pub fn get(conn: &Connection) -> Result<Self, Error> {
        Self::get_opt(conn)?.ok_or_else(|| Error::not_found("coordination server", "hub"))
    }

    pub fn get_opt(conn: &Connection) -> Result<Option<Self>, Error> {
        Ok(conn
            .query_row(
                &format!("{} ORDER BY id LIMIT 1", Self::SELECT),
                [],
                Self::from_row,
            )
            .optional()?)
    }

    pub fn update(&mut self, conn: &Connection, contents: ServerContents) -> Result<(), Error> {
        // Identity and address plan are fixed after creation; only the
        // reachable surface may change.
        let new_contents = ServerContents {
            endpoint: contents.endpoint,
            listen_port: contents.listen_port,
            mtu: contents.mtu,
            ssh_host_id: contents.ssh_host_id,
            ..self.contents.clone()
        };
        conn.execute(
            "UPDATE servers SET endpoint = ?1, listen_port = ?2, mtu = ?3, ssh_host_id = ?4
             WHERE id = ?5",
            params![
                new_contents.endpoint.to_string(),
                new_contents.listen_port,
                new_contents.mtu,
                new_contents.ssh_host_id,
                self.id,
            ],
        )?;
        self.inner.contents = new_contents;
        Ok(())
    }

    pub fn private_key(&self, conn: &Connection, vault: &Vault) -> Result<String, Error> {
        let stored: String = conn.query_row(
            "SELECT private_key FROM servers WHERE id = ?1",
            params![self.id],
            |row| row.get(0),
        )?;
        vault.unseal(&stored)
    }

    /// Installs a freshly generated key pair, recording rotation history.
    /// `permanent_guid` is untouched.
    pub fn rotate_keys(
        &mut self,
        conn: &Connection,
        vault: &Vault,
        keypair: &KeyPair,
        reason: &str,
    ) -> Result<(), Error> {
        let old_public = self.public_key.clone();
        let new_public = keypair.public.to_base64();
        conn.execute(
            "UPDATE servers SET public_key = ?1, private_key = ?2 WHERE id = ?3",
            params![new_public, vault.seal(&keypair.private.to_base64())?, self.id],
        )?;
        DatabaseRotation::record(
            conn,
            "server",
            self.id,
            &self.permanent_guid,
            &old_public,
            &new_public,
            reason,
        )?;
        self.inner.contents.public_key = new_public;
        Ok(())
    }

    /// Every VPN address currently assigned under this hub, both families.
    pub fn used_addresses(conn: &Connection) -> Result<Vec<IpAddr>, Error> {
        let mut used = Vec::new();
        for table in ["servers", "routers", "remotes", "exits"] {
            let mut stmt = conn.prepare(&format!(
                "SELECT ipv4_addr, ipv6_addr FROM {table}"
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                ))
            })?;
            for row in rows {
                let (v4, v6) = row?;
                if let Some(addr) = v4.and_then(|s| s.parse().ok()) {
                    used.push(addr);
                }
                if let Some(addr) = v6.and_then(|s| s.parse().ok()) {
                    used.push(addr);
                }
            }
        }
        Ok(used)
    }

    /// Wipes the topology: the hub row cascades to routers, remotes, exits
    /// and their ordering rows.
    pub fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
        conn.execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        Ok(())
    }
}
