use std::{
    net::IpAddr,
    ops::{Deref, DerefMut},
};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use wgfleet_conf::KeyPair;
use wgfleet_shared::{
    Exit, ExitContents, ExitGroup, ExitGroupContents, ExitGroupMember, ExitHealth, FailoverRecord,
    HealthState, PeerRole,
};

use super::{now_ts, opt_ts, to_ts, DatabasePeerOrder, DatabaseRotation};
use crate::{db, vault::Vault, Error};

#[derive(Debug)]
pub struct DatabaseExit {
    pub inner: Exit,
}

impl From<Exit> for DatabaseExit {
    fn from(inner: Exit) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseExit {
    type Target = Exit;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseExit {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseExit {
    pub fn create(
        conn: &Connection,
        vault: &Vault,
        mut contents: ExitContents,
        private_key: Option<&str>,
    ) -> Result<Self, Error> {
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
        log::info!("creating exit node {}", contents.hostname);

        conn.execute(
            "INSERT INTO exits
               (server_id, hostname, endpoint, listen_port, ipv4_addr, ipv6_addr,
                public_key, private_key, permanent_guid, ssh_host_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                contents.server_id,
                &*contents.hostname,
                contents.endpoint.to_string(),
                contents.listen_port,
                contents.ipv4_addr.map(|a| a.to_string()),
                contents.ipv6_addr.map(|a| a.to_string()),
                contents.public_key,
                private_key.map(|k| vault.seal(k)).transpose()?,
                contents.permanent_guid,
                contents.ssh_host_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        DatabasePeerOrder::append(conn, contents.server_id, PeerRole::Exit, id)?;
        DatabaseExitHealth::ensure(conn, id)?;
        Ok(Exit { id, contents }.into())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        let parse_err = |_| rusqlite::Error::ExecuteReturnedResults;
        Ok(Exit {
            id: row.get(0)?,
            contents: ExitContents {
                server_id: row.get(1)?,
                hostname: row.get::<_, String>(2)?.parse().map_err(parse_err)?,
                endpoint: row.get::<_, String>(3)?.parse().map_err(parse_err)?,
                listen_port: row.get(4)?,
                ipv4_addr: row
                    .get::<_, Option<String>>(5)?
                    .and_then(|s| s.parse().ok()),
                ipv6_addr: row
                    .get::<_, Option<String>>(6)?
                    .and_then(|s| s.parse().ok()),
                public_key: row.get(7)?,
                permanent_guid: row.get(8)?,
                ssh_host_id: row.get(9)?,
            },
        }
        .into())
    }

    const SELECT: &'static str = "SELECT id, server_id, hostname, endpoint, listen_port,
        ipv4_addr, ipv6_addr, public_key, permanent_guid, ssh_host_id FROM exits";

    pub fn get(conn: &Connection, id: i64) -> Result<Self, Error> {
        Ok(conn.query_row(
            &format!("{} WHERE id = ?1", Self::SELECT),
            params![id],
            Self::from_row,
        )?)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Self, Error> {
        conn.query_row(
            &format!("{} WHERE hostname = ?1", Self::SELECT),
            params![name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("exit node", name))
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, Error> {
        let mut stmt = conn.prepare_cached(&format!("{} ORDER BY id", Self::SELECT))?;
        let exits = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(exits)
    }

    pub fn private_key(&self, conn: &Connection, vault: &Vault) -> Result<Option<String>, Error> {
        let stored: Option<String> = conn.query_row(
            "SELECT private_key FROM exits WHERE id = ?1",
            params![self.id],
            |row| row.get(0),
        )?;
        vault.unseal_opt(stored)
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
        conn.execute(
            "UPDATE exits SET public_key = ?1, private_key = ?2 WHERE id = ?3",
            params![new_public, vault.seal(&keypair.private.to_base64())?, self.id],
        )?;
        DatabaseRotation::record(
            conn,
            "exit",
            self.id,
            &self.permanent_guid,
            &old_public,
            &new_public,
            reason,
        )?;
        self.inner.contents.public_key = new_public;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
        let exit = Self::get(conn, id)?;
        DatabasePeerOrder::remove(conn, exit.server_id, PeerRole::Exit, id)?;
        conn.execute("DELETE FROM exits WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct DatabaseExitGroup {
    pub inner: ExitGroup,
}

impl From<ExitGroup> for DatabaseExitGroup {
    fn from(inner: ExitGroup) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseExitGroup {
    type Target = ExitGroup;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DatabaseExitGroup {
    pub fn create(conn: &Connection, contents: ExitGroupContents) -> Result<Self, Error> {
        conn.execute(
            "INSERT INTO exit_groups (name, strategy, check_interval_secs, check_timeout_secs)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                contents.name,
                contents.strategy.as_str(),
                contents.check_interval_secs,
                contents.check_timeout_secs,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(ExitGroup { id, contents }.into())
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(ExitGroup {
            id: row.get(0)?,
            contents: ExitGroupContents {
                name: row.get(1)?,
                strategy: row
                    .get::<_, String>(2)?
                    .parse()
                    .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
                check_interval_secs: row.get(3)?,
                check_timeout_secs: row.get(4)?,
            },
        }
        .into())
    }

    const SELECT: &'static str =
        "SELECT id, name, strategy, check_interval_secs, check_timeout_secs FROM exit_groups";

    pub fn get(conn: &Connection, id: i64) -> Result<Self, Error> {
        Ok(conn.query_row(
            &format!("{} WHERE id = ?1", Self::SELECT),
            params![id],
            Self::from_row,
        )?)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Self, Error> {
        conn.query_row(
            &format!("{} WHERE name = ?1", Self::SELECT),
            params![name],
            Self::from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("exit group", name))
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, Error> {
        let mut stmt = conn.prepare_cached(&format!("{} ORDER BY name", Self::SELECT))?;
        let groups = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(groups)
    }

    pub fn add_member(
        &self,
        conn: &Connection,
        exit_id: i64,
        static_priority: i64,
        weight: u32,
    ) -> Result<(), Error> {
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM exit_group_members WHERE group_id = ?1",
            params![self.id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO exit_group_members
               (group_id, exit_id, seq, static_priority, weight)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![self.id, exit_id, seq, static_priority, weight],
        )?;
        Ok(())
    }

    pub fn members(&self, conn: &Connection) -> Result<Vec<ExitGroupMember>, Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT exit_id, seq, static_priority, priority_adjustment, weight, enabled
             FROM exit_group_members WHERE group_id = ?1 ORDER BY seq",
        )?;
        let members = stmt
            .query_map(params![self.id], |row| {
                Ok(ExitGroupMember {
                    exit_id: row.get(0)?,
                    seq: row.get(1)?,
                    static_priority: row.get(2)?,
                    priority_adjustment: row.get(3)?,
                    weight: row.get(4)?,
                    enabled: row.get(5)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(members)
    }

    pub fn set_member_enabled(
        &self,
        conn: &Connection,
        exit_id: i64,
        enabled: bool,
    ) -> Result<(), Error> {
        conn.execute(
            "UPDATE exit_group_members SET enabled = ?1 WHERE group_id = ?2 AND exit_id = ?3",
            params![enabled, self.id, exit_id],
        )?;
        Ok(())
    }

    /// Round-robin cursor, advanced on every selection under that strategy.
    pub fn rr_cursor(&self, conn: &Connection) -> Result<i64, Error> {
        Ok(conn.query_row(
            "SELECT rr_cursor FROM exit_groups WHERE id = ?1",
            params![self.id],
            |row| row.get(0),
        )?)
    }

    pub fn set_rr_cursor(&self, conn: &Connection, cursor: i64) -> Result<(), Error> {
        conn.execute(
            "UPDATE exit_groups SET rr_cursor = ?1 WHERE id = ?2",
            params![cursor, self.id],
        )?;
        Ok(())
    }

    pub fn delete(conn: &Connection, id: i64) -> Result<(), Error> {
        match conn.execute("DELETE FROM exit_groups WHERE id = ?1", params![id])? {
            0 => Err(Error::not_found("exit group", id.to_string())),
            _ => Ok(()),
        }
    }
}

/// Health rows, one per exit node.
pub struct DatabaseExitHealth;

impl DatabaseExitHealth {
    pub fn ensure(conn: &Connection, exit_id: i64) -> Result<(), Error> {
        conn.execute(
            "INSERT OR IGNORE INTO exit_health (exit_id) VALUES (?1)",
            params![exit_id],
        )?;
        Ok(())
    }

    fn from_row(row: &rusqlite::Row) -> Result<ExitHealth, rusqlite::Error> {
        let samples: String = row.get(9)?;
        Ok(ExitHealth {
            exit_id: row.get(0)?,
            state: row
                .get::<_, String>(1)?
                .parse()
                .map_err(|_| rusqlite::Error::ExecuteReturnedResults)?,
            last_check_at: opt_ts(row.get(2)?),
            latency_ms: row.get(3)?,
            latency_samples: samples
                .split(',')
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.parse().ok())
                .collect(),
            consecutive_failures: row.get(4)?,
            consecutive_successes: row.get(5)?,
            last_success_at: opt_ts(row.get(6)?),
            last_failure_at: opt_ts(row.get(7)?),
            failure_reason: row.get(8)?,
        })
    }

    const SELECT: &'static str = "SELECT exit_id, state, last_check_at, latency_ms,
        consecutive_failures, consecutive_successes, last_success_at, last_failure_at,
        failure_reason, latency_samples FROM exit_health";

    pub fn get(conn: &Connection, exit_id: i64) -> Result<ExitHealth, Error> {
        Self::ensure(conn, exit_id)?;
        Ok(conn.query_row(
            &format!("{} WHERE exit_id = ?1", Self::SELECT),
            params![exit_id],
            Self::from_row,
        )?)
    }

    pub fn list(conn: &Connection) -> Result<Vec<ExitHealth>, Error> {
        let mut stmt = conn.prepare_cached(&format!("{} ORDER BY exit_id", Self::SELECT))?;
        let rows = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn store(conn: &Connection, health: &ExitHealth) -> Result<(), Error> {
        Self::ensure(conn, health.exit_id)?;
        let samples = health
            .latency_samples
            .iter()
            .map(|ms| ms.to_string())
            .collect::<Vec<_>>()
            .join(",");
        conn.execute(
            "UPDATE exit_health SET state = ?1, last_check_at = ?2, latency_ms = ?3,
                latency_samples = ?4, consecutive_failures = ?5, consecutive_successes = ?6,
                last_success_at = ?7, last_failure_at = ?8, failure_reason = ?9
             WHERE exit_id = ?10",
            params![
                health.state.as_str(),
                health.last_check_at.map(to_ts),
                health.latency_ms,
                samples,
                health.consecutive_failures,
                health.consecutive_successes,
                health.last_success_at.map(to_ts),
                health.last_failure_at.map(to_ts),
                health.failure_reason,
                health.exit_id,
            ],
        )?;
        Ok(())
    }
}

/// Append-only failover decisions.
pub struct DatabaseFailover;

impl DatabaseFailover {
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        conn: &Connection,
        remote_id: i64,
        group_id: i64,
        from_exit_id: Option<i64>,
        to_exit_id: Option<i64>,
        trigger_reason: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<i64, Error> {
        conn.execute(
            "INSERT INTO failover_history
               (remote_id, group_id, from_exit_id, to_exit_id, trigger_reason,
                success, error_message, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                remote_id,
                group_id,
                from_exit_id,
                to_exit_id,
                trigger_reason,
                success,
                error_message,
                now_ts(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn from_row(row: &rusqlite::Row) -> Result<FailoverRecord, rusqlite::Error> {
        Ok(FailoverRecord {
            id: row.get(0)?,
            remote_id: row.get(1)?,
            group_id: row.get(2)?,
            from_exit_id: row.get(3)?,
            to_exit_id: row.get(4)?,
            trigger_reason: row.get(5)?,
            success: row.get(6)?,
            error_message: row.get(7)?,
            timestamp: opt_ts(row.get(8)?).unwrap_or_else(Utc::now),
        })
    }

    const SELECT: &'static str = "SELECT id, remote_id, group_id, from_exit_id, to_exit_id,
        trigger_reason, success, error_message, timestamp FROM failover_history";

    pub fn list_for_remote(conn: &Connection, remote_id: i64) -> Result<Vec<FailoverRecord>, Error> {
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE remote_id = ?1 ORDER BY id", Self::SELECT))?;
        let rows = stmt
            .query_map(params![remote_id], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn list_recent(conn: &Connection, limit: u32) -> Result<Vec<FailoverRecord>, Error> {
        let mut stmt =
            conn.prepare_cached(&format!("{} ORDER BY id DESC LIMIT ?1", Self::SELECT))?;
        let rows = stmt
            .query_map(params![limit], Self::from_row)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}
