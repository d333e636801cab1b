use std::{
    net::IpAddr,
    ops::{Deref, DerefMut},
};

use ipnet::IpNet;
use rusqlite::{params, Connection, OptionalExtension};
use wgfleet_conf::KeyPair;
use wgfleet_shared::{PeerRole, Router, RouterContents};

use super::{DatabasePeerOrder, DatabaseRotation};
use crate::{db, vault::Vault, Error};

/// Subnet router rows plus their ordered advertised-LAN list.
#[derive(Debug)]
pub struct DatabaseRouter {
    pub inner: Router,
}

impl From<Router> for DatabaseRouter {
    fn from(inner: Router) -> Self {
        Self { inner }
    }
}

impl Deref for DatabaseRouter {
    type Target = Router;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for DatabaseRouter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl DatabaseRouter {
    pub fn create(
        conn: &Connection,
        vault: &Vault,
        mut contents: RouterContents,
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
        contents.has_endpoint = contents.endpoint.is_some();
        log::info!("creating subnet router {}", contents.hostname);

        conn.execute(
            "INSERT INTO routers
               (server_id, hostname, ipv4_addr, ipv6_addr, endpoint, has_endpoint,
                allowed_ips, public_key, private_key, permanent_guid, ssh_host_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                contents.server_id,
                &*contents.hostname,
                contents.ipv4_addr.map(|a| a.to_string()),
                contents.ipv6_addr.map(|a| a.to_string()),
                contents.endpoint.as_ref().map(|e| e.to_string()),
                contents.has_endpoint,
                contents.allowed_ips,
                contents.public_key,
                private_key.map(|k| vault.seal(k)).transpose()?,
                contents.permanent_guid,
                contents.ssh_host_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::store_lans(conn, id, &contents.lans)?;
        DatabasePeerOrder::append(conn, contents.server_id, PeerRole::Router, id)?;
        Ok(Router { id, contents }.into())
    }

    fn store_lans(conn: &Connection, id: i64, lans: &[IpNet]) -> Result<(), Error> {
        conn.execute("DELETE FROM router_lans WHERE router_id = ?1", params![id])?;
        for (seq, lan) in lans.iter().enumerate() {
            conn.execute(
                "INSERT INTO router_lans (router_id, seq, cidr) VALUES (?1, ?2, ?3)",
                params![id, seq as i64, lan.to_string()],
            )?;
        }
        Ok(())
    }

    fn load_lans(conn: &Connection, id: i64) -> Result<Vec<IpNet>, Error> {
        let mut stmt = conn.prepare_cached(
            "SELECT cidr FROM router_lans WHERE router_id = ?1 ORDER BY seq",
        )?;
        let lans = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok().and_then(|s| s.parse().ok()))
            .collect();
        Ok(lans)
    }

    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        let parse_err = |_| rusqlite::Error::ExecuteReturnedResults;
        Ok(Router {
            id: row.get(0)?,
            contents: RouterContents {
                server_id: row.get(1)?,
                hostname: row.get::<_, String>(2)?.parse().map_err(parse_err)?,
                ipv4_addr: row
                    .get::<_, Option<String>>(3)?
                    .and_then(|s| s.parse().ok()),
                ipv6_addr: row
                    .get::<_, Option<String>>(4)?
                    .and_then(|s| s.parse().ok()),
                endpoint: row
                    .get::<_, Option<String>>(5)?
                    .and_then(|s| s.parse().ok()),
                has_endpoint: row.get(6)?,
                allowed_ips: row.get(7)?,
                public_key: row.get(8)?,
                permanent_guid: row.get(9)?,
                ssh_host_id: row.get(10)?,
                lans: Vec::new(),
            },
        }
        .into())
    }

    const SELECT: &'static str = "SELECT id, server_id, hostname, ipv4_addr, ipv6_addr,
        endpoint, has_endpoint, allowed_ips, public_key, permanent_guid, ssh_host_id
        FROM routers";

    fn hydrate(mut router: Self, conn: &Connection) -> Result<Self, Error> {
        router.inner.contents.lans = Self::load_lans(conn, router.id)?;
        Ok(router)
    }

    pub fn get(conn: &Connection, id: i64) -> Result<Self, Error> {
        let router = conn.query_row(
            &format!("{} WHERE id = ?1", Self::SELECT),
            params![id],
            Self::from_row,
        )?;
        Self::hydrate(router, conn)
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> Result<Self, Error> {
        let router = conn
            .query_row(
                &format!("{} WHERE hostname = ?1", Self::SELECT),
                params![name],
                Self::from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("router", name))?;
        Self::hydrate(router, conn)
    }

    pub fn list(conn: &Connection) -> Result<Vec<Self>, Error> {
        let mut stmt = conn.prepare_cached(&format!("{} ORDER BY id", Self::SELECT))?;
        let routers: Vec<Self> = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<_, _>>()?;
        routers
            .into_iter()
            .map(|r| Self::hydrate(r, conn))
            .collect()
    }

    pub fn update(&mut self, conn: &Connection, contents: RouterContents) -> Result<(), Error> {
        // Identity fields (keys, guid, address, parent hub) stay put.
        let new_contents = RouterContents {
            endpoint: contents.endpoint,
            has_endpoint: contents.has_endpoint,
            lans: contents.lans,
            allowed_ips: contents.allowed_ips,
            ssh_host_id: contents.ssh_host_id,
            ..self.contents.clone()
        };
        conn.execute(
            "UPDATE routers SET endpoint = ?1, has_endpoint = ?2, allowed_ips = ?3,
                ssh_host_id = ?4
             WHERE id = ?5",
            params![
                new_contents.endpoint.as_ref().map(|e| e.to_string()),
                new_contents.has_endpoint,
                new_contents.allowed_ips,
                new_contents.ssh_host_id,
                self.id,
            ],
        )?;
        Self::store_lans(conn, self.id, &new_contents.lans)?;
        self.inner.contents = new_contents;
        Ok(())
    }

    pub fn private_key(&self, conn: &Connection, vault: &Vault) -> Result<Option<String>, Error> {
        let stored: Option<String> = conn.query_row(
            "SELECT private_key FROM routers WHERE id = ?1",
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
            "UPDATE routers SET public_key = ?1, private_key = ?2 WHERE id = ?3",
            params![new_public, vault.seal(&keypair.private.to_base64())?, self.id],
        )?;
        DatabaseRotation::record(
            conn,
            "router",
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
        let router = Self::get(conn, id)?;
        DatabasePeerOrder::remove(conn, router.server_id, PeerRole::Router, id)?;
        conn.execute("DELETE FROM routers WHERE id = ?1", params![id])?;
        Ok(())
    }
}
