use std::ops::{Deref, DerefMut};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use wgfleet_conf::KeyPair;
use wgfleet_shared::{
    ExtramuralConfig, ExtramuralConfigContents, ExtramuralPeer, ExtramuralPeerContents, LocalPeer,
    Sponsor,
};

use super::{now_ts, opt_ts, DatabaseRotation};
use crate::{vault::Vault, Error};

pub struct DatabaseSponsor;

impl DatabaseSponsor {
    pub fn create(conn: &Connection, name: &str, website: Option<&str>) -> Result<Sponsor, Error> {
        conn.execute(
            "INSERT INTO sponsors (name, website) VALUES (?1, ?2)",
            params![name, website],
        )?;
        Ok(Sponsor {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            website: website.map(str::to_string),
        })
    }

    fn from_row(row: &rusqlite::Row) -> Result<Sponsor, rusqlite::Error> {
        Ok(Sponsor {
            id: row.get(0)?,
            name: row.get(1)?,
            website: row.get(2)?,
        })
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Sponsor, Error> {
        conn.query_row(
            "SELECT id, name, website FROM sponsors WHERE name = ?1",
            params![name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("sponsor", name))
    }

    pub fn list(conn: &Connection) -> Result<Vec<Sponsor>, Error> {
        let mut stmt =
            conn.prepare_cached("SELECT id, name, website FROM sponsors ORDER BY name")?;
        let sponsors = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(sponsors)
    }

    /// Cascades to the sponsor's extramural configs and their peers.
    pub fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
        match conn.execute("DELETE FROM sponsors WHERE id = ?1", params![id])? {
            0 => Err(Error::not_found("sponsor", id.to_string())),
            _ => Ok(()),
        }
    }
}

pub struct DatabaseLocalPeer;

impl DatabaseLocalPeer {
    pub fn create(
        conn: &Connection,
        name: &str,
        ssh_host_id: Option<i64>,
    ) -> Result<LocalPeer, Error> {
        conn.execute(
            "INSERT INTO local_peers (name, ssh_host_id) VALUES (?1, ?2)",
            params![name, ssh_host_id],
        )?;
        Ok(LocalPeer {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            permanent_guid: None,
            ssh_host_id,
        })
    }

    fn from_row(row: &rusqlite::Row) -> Result<LocalPeer, rusqlite::Error> {
        Ok(LocalPeer {
            id: row.get(0)?,
            name: row.get(1)?,
            permanent_guid: row.get(2)?,
            ssh_host_id: row.get(3)?,
        })
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<LocalPeer, Error> {
        conn.query_row(
            "SELECT id, name, permanent_guid, ssh_host_id FROM local_peers WHERE name = ?1",
            params![name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("local peer", name))
    }

    pub fn list(conn: &Connection) -> Result<Vec<LocalPeer>, Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, permanent_guid, ssh_host_id FROM local_peers ORDER BY name",
        )?;
        let peers = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(peers)
    }

    /// The local peer's identity is the first public key observed in any of
    /// its configs; set once and never overwritten.
    pub fn adopt_guid(conn: &Connection, id: i64, public_key: &str) -> Result<(), Error> {
        conn.execute(
            "UPDATE local_peers SET permanent_guid = ?1
             WHERE id = ?2 AND permanent_guid IS NULL",
            params![public_key, id],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
        match conn.execute("DELETE FROM local_peers WHERE id = ?1", params![id])? {
            0 => Err(Error::not_found("local peer", id.to_string())),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct DatabaseExtramuralConfig {
    pub inner: ExtramuralConfig,
}

impl From<ExtramuralConfig> for DatabaseExtramuralConfig {
    fn from(inner: ExtramuralConfig) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseExtramuralConfig {
    type Target = ExtramuralConfig;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseExtramuralConfig {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseExtramuralConfig {
    pub fn create(
        conn: &Connection,
        vault: &Vault,
        mut contents: ExtramuralConfigContents,
        private_key: &str,
    ) -> Result<Self, Error> {
        contents.permanent_guid = contents.public_key.clone();
        log::info!(
            "creating extramural config for local peer {} / sponsor {}",
            contents.local_peer_id,
            contents.sponsor_id
        );
        conn.execute(
            "INSERT INTO extramural_configs
               (local_peer_id, sponsor_id, permanent_guid, public_key, private_key,
                ipv4_addr, ipv6_addr, dns, mtu, listen_port, interface_name,
                pending_remote_update, last_deployed_at, last_key_rotation_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                contents.local_peer_id,
                contents.sponsor_id,
                contents.permanent_guid,
                contents.public_key,
                vault.seal(private_key)?,
                contents.ipv4_addr.map(|a| a.to_string()),
                contents.ipv6_addr.map(|a| a.to_string()),
                contents
                    .dns
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                contents.mtu,
                contents.listen_port,
                contents.interface_name,
                contents.pending_remote_update,
                contents.last_deployed_at.map(super::to_ts),
                contents.last_key_rotation_at.map(super::to_ts),
            ],
        )?;
        let id = conn.last_insert_rowid();
        DatabaseLocalPeer::adopt_guid(conn, contents.local_peer_id, &contents.public_key)?;
        Ok(ExtramuralConfig { id, contents }.into())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        let dns_text: String = row.get(8)?;
        Ok(ExtramuralConfig {
            id: row.get(0)?,
            contents: ExtramuralConfigContents {
                local_peer_id: row.get(1)?,
                sponsor_id: row.get(2)?,
                permanent_guid: row.get(3)?,
                public_key: row.get(4)?,
                ipv4_addr: row
                    .get::<_, Option<String>>(6)?
                    .and_then(|s| s.parse().ok()),
                ipv6_addr: row
                    .get::<_, Option<String>>(7)?
                    .and_then(|s| s.parse().ok()),
                dns: dns_text
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| s.parse().ok())
                    .collect(),
                mtu: row.get(9)?,
                listen_port: row.get(10)?,
                interface_name: row.get(11)?,
                pending_remote_update: row.get(12)?,
                last_deployed_at: opt_ts(row.get(13)?),
                last_key_rotation_at: opt_ts(row.get(14)?),
            },
        }
        .into())
    }

    const SELECT: &'static str = "SELECT id, local_peer_id, sponsor_id, permanent_guid,
        public_key, private_key, ipv4_addr, ipv6_addr, dns, mtu, listen_port,
        interface_name, pending_remote_update, last_deployed_at, last_key_rotation_at
        FROM extramural_configs";

    pub fn get(conn: &Connection, id: i64) -> Result<Self, Error> {
        Ok(conn.query_row(
            &format!("{} WHERE id = ?1", Self::SELECT),
            params![id],
            Self::from_row,
        )?)
    }

    /// Looks up a config by its `<local-peer>/<sponsor>` reference.
    pub fn get_by_ref(conn: &Connection, reference: &str) -> Result<Self, Error> {
        let (peer_name, sponsor_name) = reference.split_once('/').ok_or_else(|| {
            Error::validation("config", "expected a <local-peer>/<sponsor> reference")
        })?;
        let local_peer = DatabaseLocalPeer::get_by_name(conn, peer_name)?;
        let sponsor = DatabaseSponsor::get_by_name(conn, sponsor_name)?;
        conn.query_row(
            &format!(
                "{} WHERE local_peer_id = ?1 AND sponsor_id = ?2",
                Self::SELECT
            ),
            params![local_peer.id, sponsor.id],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("extramural config", reference))
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, Error> {
        let mut stmt = conn.prepare_cached(&format!("{} ORDER BY id", Self::SELECT))?;
        let configs = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(configs)
    }

    pub fn private_key(&self, conn: &Connection, vault: &Vault) -> Result<String, Error> {
        let stored: String = conn.query_row(
            "SELECT private_key FROM extramural_configs WHERE id = ?1",
            params![self.id],
            |row| row.get(0),
        )?;
        vault.unseal(&stored)
    }

    /// Rotates the local key pair. The sponsor still has the old key, so
    /// `pending_remote_update` latches on until the operator confirms.
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
            "UPDATE extramural_configs SET public_key = ?1, private_key = ?2,
                pending_remote_update = 1, last_key_rotation_at = ?3
             WHERE id = ?4",
            params![
                new_public,
                vault.seal(&keypair.private.to_base64())?,
                now_ts(),
                self.id
            ],
        )?;
        DatabaseRotation::record(
            conn,
            "extramural_config",
            self.id,
            &self.permanent_guid,
            &old_public,
            &new_public,
            reason,
        )?;
        self.inner.contents.public_key = new_public;
        self.inner.contents.pending_remote_update = true;
        self.inner.contents.last_key_rotation_at = Some(Utc::now());
        Ok(())
    }

    /// Operator confirmation that the sponsor has the new key.
    pub fn confirm_remote_update(conn: &Connection, id: i64) -> Result<(), Error> {
        conn.execute(
            "UPDATE extramural_configs SET pending_remote_update = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn touch_deployed(conn: &Connection, id: i64) -> Result<(), Error> {
        conn.execute(
            "UPDATE extramural_configs SET last_deployed_at = ?1 WHERE id = ?2",
            params![now_ts(), id],
        )?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct DatabaseExtramuralPeer {
    pub inner: ExtramuralPeer,
}

impl From<ExtramuralPeer> for DatabaseExtramuralPeer {
    fn from(inner: ExtramuralPeer) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseExtramuralPeer {
    type Target = ExtramuralPeer;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DatabaseExtramuralPeer {
    pub fn create(
        conn: &Connection,
        vault: &Vault,
        mut contents: ExtramuralPeerContents,
        preshared_key: Option<&str>,
    ) -> Result<Self, Error> {
        contents.has_psk = preshared_key.is_some();
        conn.execute(
            "INSERT INTO extramural_peers
               (config_id, name, public_key, endpoint, allowed_ips, preshared_key,
                keepalive, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                contents.config_id,
                contents.name,
                contents.public_key,
                contents.endpoint.to_string(),
                contents.allowed_ips,
                preshared_key.map(|k| vault.seal(k)).transpose()?,
                contents.keepalive,
                contents.is_active,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(ExtramuralPeer { id, contents }.into())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        let parse_err = |_| rusqlite::Error::ExecuteReturnedResults;
        Ok(ExtramuralPeer {
            id: row.get(0)?,
            contents: ExtramuralPeerContents {
                config_id: row.get(1)?,
                name: row.get(2)?,
                public_key: row.get(3)?,
                endpoint: row.get::<_, String>(4)?.parse().map_err(parse_err)?,
                allowed_ips: row.get(5)?,
                has_psk: row.get::<_, Option<String>>(6)?.is_some(),
                keepalive: row.get(7)?,
                is_active: row.get(8)?,
            },
        }
        .into())
    }

    const SELECT: &'static str = "SELECT id, config_id, name, public_key, endpoint,
        allowed_ips, preshared_key, keepalive, is_active FROM extramural_peers";

    pub fn list_for_config(conn: &Connection, config_id: i64) -> Result<Vec<Self>, Error> {
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE config_id = ?1 ORDER BY id", Self::SELECT))?;
        let peers = stmt
            .query_map(params![config_id], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(peers)
    }

    pub fn get_by_name(conn: &Connection, config_id: i64, name: &str) -> Result<Self, Error> {
        conn.query_row(
            &format!("{} WHERE config_id = ?1 AND name = ?2", Self::SELECT),
            params![config_id, name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("extramural peer", name))
    }

    /// The unique active peer for a config, enforced by the database
    /// trigger.
    pub fn active_for(conn: &Connection, config_id: i64) -> Result<Option<Self>, Error> {
        Ok(conn
            .query_row(
                &format!("{} WHERE config_id = ?1 AND is_active = 1", Self::SELECT),
                params![config_id],
                Self::from_row,
            )
            .optional()?)
    }

    /// Activates this peer; the trigger deactivates its siblings.
    pub fn activate(conn: &Connection, id: i64) -> Result<(), Error> {
        match conn.execute(
            "UPDATE extramural_peers SET is_active = 1 WHERE id = ?1",
            params![id],
        )? {
            0 => Err(Error::not_found("extramural peer", id.to_string())),
            _ => Ok(()),
        }
    }

    pub fn preshared_key(
        &self,
        conn: &Connection,
        vault: &Vault,
    ) -> Result<Option<String>, Error> {
        let stored: Option<String> = conn.query_row(
            "SELECT preshared_key FROM extramural_peers WHERE id = ?1",
            params![self.id],
            |row| row.get(0),
        )?;
        vault.unseal_opt(stored)
    }
}
