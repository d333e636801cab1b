use std::{
    net::IpAddr,
    ops::{Deref, DerefMut},
};

use chrono::Utc;
use ipnet::IpNet;
use rusqlite::{params, Connection, OptionalExtension};
use wgfleet_conf::KeyPair;
use wgfleet_shared::{AccessLevel, PeerRole, Remote, RemoteContents};

use super::{now_ts, opt_ts, DatabasePeerOrder, DatabaseRotation};
use crate::{db, vault::Vault, Error};

/// Client peer rows. A remote may be "provisional": known only by its
/// public key, private key never stored.
#[derive(Debug)]
pub struct DatabaseRemote {
    pub inner: Remote,
}

impl From<Remote> for DatabaseRemote {
    fn from(inner: Remote) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseRemote {
    type Target = Remote;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseRemote {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseRemote {
    pub fn create(
        conn: &Connection,
        vault: &Vault,
        mut contents: RemoteContents,
        private_key: Option<&str>,
        preshared_key: Option<&str>,
    ) -> Result<Self, Error> {
        validate_exit_linkage(&contents)?;
        if contents.ipv4_addr.is_none() && contents.ipv6_addr.is_none() {
            return Err(Error::validation(
                "address",
                "a remote needs a VPN address in at least one family",
            ));
        }
        let mut addrs: Vec<IpAddr> = Vec::new();
        if let Some(v4) = contents.ipv4_addr {
            addrs.push(v4.into());
        }
        if let Some(v6) = contents.ipv6_addr {
            addrs.push(v6.into());
        }
        for addr in &addrs {
            if db::vpn_address_in_use(conn, *addr)? {
                return Err(Error::Conflict(format!("VPN address {addr} already assigned")));
            }
        }
        contents.permanent_guid = contents.public_key.clone();
        contents.has_psk = preshared_key.is_some();
        log::info!("creating remote {}", contents.hostname);

        conn.execute(
            "INSERT INTO remotes
               (server_id, hostname, ipv4_addr, ipv6_addr, public_key, private_key,
                permanent_guid, access_level, custom_allowed_ips, exit_node_id,
                exit_group_id, active_exit_id, preshared_key, keepalive, last_rotated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                contents.server_id,
                &*contents.hostname,
                contents.ipv4_addr.map(|a| a.to_string()),
                contents.ipv6_addr.map(|a| a.to_string()),
                contents.public_key,
                private_key.map(|k| vault.seal(k)).transpose()?,
                contents.permanent_guid,
                contents.access_level.as_str(),
                contents.custom_allowed_ips,
                contents.exit_node_id,
                contents.exit_group_id,
                contents.active_exit_id,
                preshared_key.map(|k| vault.seal(k)).transpose()?,
                contents.keepalive,
                contents.last_rotated_at.map(super::to_ts),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::store_lan_access(conn, id, &contents.lan_access)?;
        DatabasePeerOrder::append(conn, contents.server_id, PeerRole::Remote, id)?;
        Ok(Remote { id, contents }.into())
    }

    fn store_lan_access(conn: &Connection, id: i64, lans: &[IpNet]) -> Result<(), Error> {
        conn.execute("DELETE FROM remote_lans WHERE remote_id = ?1", params![id])?;
        for (seq, lan) in lans.iter().enumerate() {
            conn.execute(
                "INSERT INTO remote_lans (remote_id, seq, cidr) VALUES (?1, ?2, ?3)",
                params![id, seq as i64, lan.to_string()],
            )?;
        }
        Ok(())
    }

    fn load_lan_access(conn: &Connection, id: i64) -> Result<Vec<IpNet>, Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT cidr FROM remote_lans WHERE remote_id = ?1 ORDER BY seq",
        )?;
        let lans = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok().and_then(|s| s.parse().ok()))
            .collect();
        Ok(lans)
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        let parse_err = |_| rusqlite::Error::ExecuteReturnedResults;
        Ok(Remote {
            id: row.get(0)?,
            contents: RemoteContents {
                server_id: row.get(1)?,
                hostname: row.get::<_, String>(2)?.parse().map_err(parse_err)?,
                ipv4_addr: row
                    .get::<_, Option<String>>(3)?
                    .and_then(|s| s.parse().ok()),
                ipv6_addr: row
                    .get::<_, Option<String>>(4)?
                    .and_then(|s| s.parse().ok()),
                public_key: row.get(5)?,
                permanent_guid: row.get(6)?,
                access_level: row
                    .get::<_, String>(7)?
                    .parse()
                    .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
                custom_allowed_ips: row.get(8)?,
                exit_node_id: row.get(9)?,
                exit_group_id: row.get(10)?,
                active_exit_id: row.get(11)?,
                has_psk: row.get::<_, Option<String>>(12)?.is_some(),
                keepalive: row.get(13)?,
                last_rotated_at: opt_ts(row.get(14)?),
                lan_access: Vec::new(),
            },
        }
        .into())
    }

    const SELECT: &'static str = "SELECT id, server_id, hostname, ipv4_addr, ipv6_addr,
        public_key, permanent_guid, access_level, custom_allowed_ips, exit_node_id,
        exit_group_id, active_exit_id, preshared_key, keepalive, last_rotated_at
        FROM remotes";

    fn hydrate(mut remote: Self, conn: &Connection) -> Result<Self, Error> {
        remote.inner.contents.lan_access = Self::load_lan_access(conn, remote.id)?;
        Ok(remote)
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Self, Error> {
        let remote = conn.query_row(
            &format!("{} WHERE id = ?1", Self::SELECT),
            params![id],
            Self::from_row,
        )?;
        Self::hydrate(remote, conn)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Self, Error> {
        let remote = conn
            .query_row(
                &format!("{} WHERE hostname = ?1", Self::SELECT),
                params![name],
                Self::from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("remote", name))?;
        Self::hydrate(remote, conn)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, Error> {
        let mut stmt = conn.prepare_cached(&format!("{} ORDER BY id", Self::SELECT))?;
        let remotes: Vec<Self> = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        remotes
            .into_iter()
            .map(|r| Self::hydrate(r, conn))
            .collect()
    }

    /// Remotes whose live exit assignment is the given exit.
    pub fn list_on_exit(conn: &Connection, exit_id: i64) -> Result<Vec<Self>, Error> {
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE active_exit_id = ?1 ORDER BY id",
            Self::SELECT
        ))?;
        let remotes: Vec<Self> = stmt
            .query_map(params![exit_id], Self::from_row)?
            .collect::<Result<_, _>>()?;
        remotes
            .into_iter()
            .map(|r| Self::hydrate(r, conn))
            .collect()
    }

    pub fn update(&mut self, conn: &Connection, contents: RemoteContents) -> Result<(), Error> {
        validate_exit_linkage(&contents)?;
        // Keys, guid, address and parent hub are not updatable here.
        let new_contents = RemoteContents {
            access_level: contents.access_level,
            lan_access: contents.lan_access,
            custom_allowed_ips: contents.custom_allowed_ips,
            exit_node_id: contents.exit_node_id,
            exit_group_id: contents.exit_group_id,
            active_exit_id: contents.active_exit_id,
            keepalive: contents.keepalive,
            ..self.contents.clone()
        };
        conn.execute(
            "UPDATE remotes SET access_level = ?1, custom_allowed_ips = ?2,
                exit_node_id = ?3, exit_group_id = ?4, active_exit_id = ?5, keepalive = ?6
             WHERE id = ?7",
            params![
                new_contents.access_level.as_str(),
                new_contents.custom_allowed_ips,
                new_contents.exit_node_id,
                new_contents.exit_group_id,
                new_contents.active_exit_id,
                new_contents.keepalive,
                self.id,
            ],
        )?;
        Self::store_lan_access(conn, self.id, &new_contents.lan_access)?;
        self.inner.contents = new_contents;
        Ok(())
    }

    /// Moves the live exit assignment; used by the failover controller.
    pub fn set_active_exit(
        conn: &Connection,
        id: i64,
        exit_id: Option<i64>,
    ) -> Result<(), Error> {
        match conn.execute(
            "UPDATE remotes SET active_exit_id = ?1 WHERE id = ?2",
            params![exit_id, id],
        )? {
            0 => Err(Error::not_found("remote", id.to_string())),
            _ => Ok(()),
        }
    }

    pub fn private_key(&self, conn: &Connection, vault: &Vault) -> Result<Option<String>, Error> {
        let stored: Option<String> = conn.query_row(
            "SELECT private_key FROM remotes WHERE id = ?1",
            params![self.id],
            |row| row.get(0),
        )?;
        vault.unseal_opt(stored)
    }

    pub fn preshared_key(
        &self,
        conn: &Connection,
        vault: &Vault,
    ) -> Result<Option<String>, Error> {
        let stored: Option<String> = conn.query_row(
            "SELECT preshared_key FROM remotes WHERE id = ?1",
            params![self.id],
            |row| row.get(0),
        )?;
        vault.unseal_opt(stored)
    }

    pub fn set_preshared_key(
        &mut self,
        conn: &Connection,
        vault: &Vault,
        psk: Option<&str>,
    ) -> Result<(), Error> {
        conn.execute(
            "UPDATE remotes SET preshared_key = ?1 WHERE id = ?2",
            params![psk.map(|k| vault.seal(k)).transpose()?, self.id],
        )?;
        self.inner.contents.has_psk = psk.is_some();
        Ok(())
    }

    pub fn rotate_keys(
        &mut self,
        conn: &Connection,
        vault: &Vault,
        keypair: &KeyPair,
        reason: &str,
    ) -> Result<(), Error> {
        let old_public = self.public_key.clone();
        let new_public = keypair.public.to_base64();
        let rotated_at = now_ts();
        conn.execute(
            "UPDATE remotes SET public_key = ?1, private_key = ?2, last_rotated_at = ?3
             WHERE id = ?4",
            params![
                new_public,
                vault.seal(&keypair.private.to_base64())?,
                rotated_at,
                self.id
            ],
        )?;
        DatabaseRotation::record(
            conn,
            "remote",
            self.id,
            &self.permanent_guid,
            &old_public,
            &new_public,
            reason,
        )?;
        self.inner.contents.public_key = new_public;
        self.inner.contents.last_rotated_at = Some(Utc::now());
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
        let remote = Self::get(conn, id)?;
        DatabasePeerOrder::remove(conn, remote.server_id, PeerRole::Remote, id)?;
        conn.execute("DELETE FROM remotes WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn validate_exit_linkage(contents: &RemoteContents) -> Result<(), Error> {
    if contents.access_level == AccessLevel::ExitOnly
        && contents.exit_node_id.is_none()
        && contents.exit_group_id.is_none()
    {
        return Err(Error::validation(
            "exit",
            "exit_only remotes must reference an exit node or exit group",
        ));
    }
    Ok(())
}
