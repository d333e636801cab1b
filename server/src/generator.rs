//! Renders deployable `.conf` files from the model.
//!
//! Generation reconciles model state into each entity's stored document
//! rather than rewriting from scratch: fields whose meaning is unchanged
//! keep their exact bytes, imported layout (comments, spacing, unknown
//! fields) survives, and a regeneration after a one-field model change
//! touches exactly one line. Entities that never had a document get a
//! canonically formatted one.

use rusqlite::Connection;
use wgfleet_conf::{ConfDocument, FieldValue, Section, SectionKind};
use wgfleet_shared::{
    hooks::{HookCommand, HookDirection},
    Exit, ExtramuralConfig, Remote, Router, PERSISTENT_KEEPALIVE_INTERVAL_SECS,
};

use crate::{
    db::{
        DatabaseConfigDocument, DatabaseExit, DatabaseExitGroup, DatabaseExtramuralPeer,
        DatabaseHooks, DatabasePeerOrder, DatabaseRemote, DatabaseRouter, DatabaseServer,
        HookOwner,
    },
    policy::{self, RemotePeerEntry},
    vault::Vault,
    Error,
};

pub struct Generator<'a> {
    conn: &'a Connection,
    vault: &'a Vault,
}

/// One generated file, named for its deploy interface.
#[derive(Clone, Debug)]
pub struct GeneratedConfig {
    pub name: String,
    pub text: String,
    /// Public key the deployed interface must report during verification.
    pub public_key: String,
}

impl<'a> Generator<'a> {
    pub fn new(conn: &'a Connection, vault: &'a Vault) -> Self {
        Generator { conn, vault }
    }

    fn load_document(&self, owner_type: &str, owner_id: i64) -> Result<ConfDocument, Error> {
        match DatabaseConfigDocument::get(self.conn, owner_type, owner_id)? {
            Some(text) => Ok(wgfleet_conf::parse(&text)?),
            None => Ok(ConfDocument::new()),
        }
    }

    fn store_document(
        &self,
        owner_type: &str,
        owner_id: i64,
        doc: &ConfDocument,
    ) -> Result<String, Error> {
        let text = doc.to_string();
        DatabaseConfigDocument::put(self.conn, owner_type, owner_id, &text)?;
        Ok(text)
    }

    /// Rewrites peer-section public keys through the rotation history, so a
    /// rotated peer keeps its section (and that section's layout) instead
    /// of being dropped and re-added.
    fn remap_rotated_keys(&self, doc: &mut ConfDocument) -> Result<(), Error> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT old_public_key, new_public_key FROM key_rotation_history ORDER BY id",
        )?;
        let pairs: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        if pairs.is_empty() {
            return Ok(());
        }
        for section in doc.peers_mut() {
            let Some(mut key) = section.get("PublicKey") else {
                continue;
            };
            let mut changed = false;
            for _ in 0..pairs.len() {
                match pairs.iter().find(|(old, _)| *old == key) {
                    Some((_, new)) if *new != key => {
                        key = new.clone();
                        changed = true;
                    },
                    _ => break,
                }
            }
            if changed {
                section.set_if_changed("PublicKey", FieldValue::Text(key));
            }
        }
        Ok(())
    }

    fn reconcile_hooks(section: &mut Section, hooks: &[HookCommand]) {
        for direction in [
            HookDirection::PreUp,
            HookDirection::PostUp,
            HookDirection::PreDown,
            HookDirection::PostDown,
        ] {
            let values: Vec<FieldValue> = hooks
                .iter()
                .filter(|h| h.direction == direction)
                .map(|h| FieldValue::Text(h.render()))
                .collect();
            section.set_repeated(direction.as_str(), &values);
        }
    }

    /// The hub's own config: interface plus every peer in persisted order.
    pub fn hub_config(&self) -> Result<GeneratedConfig, Error> {
        let server = DatabaseServer::get(self.conn)?;
        let mut doc = self.load_document("server", server.id)?;

        let mut addresses = Vec::new();
        if let (Some(addr), Some(cidr)) = (server.ipv4_addr, server.ipv4_cidr) {
            addresses.push(format!("{}/{}", addr, cidr.prefix_len()));
        }
        if let (Some(addr), Some(cidr)) = (server.ipv6_addr, server.ipv6_cidr) {
            addresses.push(format!("{}/{}", addr, cidr.prefix_len()));
        }

        {
            let interface = doc.interface_mut();
            interface.set_if_changed(
                "PrivateKey",
                FieldValue::Text(server.private_key(self.conn, self.vault)?),
            );
            interface.set_if_changed("Address", FieldValue::list(addresses));
            interface.set_if_changed(
                "ListenPort",
                FieldValue::Text(server.listen_port.to_string()),
            );
            match server.mtu {
                Some(mtu) => interface.set_if_changed("MTU", FieldValue::Text(mtu.to_string())),
                None => {
                    interface.remove("MTU");
                },
            }
            let hooks = DatabaseHooks::list(self.conn, HookOwner::Server(server.id))?;
            Self::reconcile_hooks(interface, &hooks);
        }

        // Assemble peers in the persisted order. Exit-only remotes have no
        // entry in the hub config at all.
        struct HubPeer {
            public_key: String,
            psk: Option<String>,
            allowed_ips: Vec<String>,
            endpoint: Option<String>,
            keepalive: Option<u16>,
        }

        let mut hub_peers: Vec<HubPeer> = Vec::new();
        for entry in DatabasePeerOrder::list(self.conn, server.id)? {
            match entry.role {
                wgfleet_shared::PeerRole::Router => {
                    let router = DatabaseRouter::get(self.conn, entry.peer_id)?;
                    hub_peers.push(HubPeer {
                        public_key: router.public_key.clone(),
                        psk: None,
                        allowed_ips: router
                            .allowed_ips
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect(),
                        endpoint: router
                            .endpoint
                            .as_ref()
                            .filter(|_| router.has_endpoint)
                            .map(|e| e.to_string()),
                        keepalive: None,
                    });
                },
                wgfleet_shared::PeerRole::Remote => {
                    let remote = DatabaseRemote::get(self.conn, entry.peer_id)?;
                    if remote.access_level == wgfleet_shared::AccessLevel::ExitOnly {
                        continue;
                    }
                    hub_peers.push(HubPeer {
                        public_key: remote.public_key.clone(),
                        psk: remote.preshared_key(self.conn, self.vault)?,
                        allowed_ips: remote
                            .addresses()
                            .iter()
                            .map(|a| a.to_string())
                            .collect(),
                        endpoint: None,
                        keepalive: None,
                    });
                },
                wgfleet_shared::PeerRole::Exit => {
                    let exit = DatabaseExit::get(self.conn, entry.peer_id)?;
                    hub_peers.push(HubPeer {
                        public_key: exit.public_key.clone(),
                        psk: None,
                        allowed_ips: exit.addresses().iter().map(|a| a.to_string()).collect(),
                        endpoint: Some(exit.endpoint.to_string()),
                        keepalive: None,
                    });
                },
            }
        }

        self.remap_rotated_keys(&mut doc)?;
        let wanted_keys: Vec<String> = hub_peers.iter().map(|p| p.public_key.clone()).collect();
        doc.retain_peers(|section| {
            section
                .get("PublicKey")
                .map(|key| wanted_keys.contains(&key))
                .unwrap_or(false)
        });

        let existing_keys: Vec<String> = doc
            .peers()
            .filter_map(|s| s.get("PublicKey"))
            .collect();
        for peer in &hub_peers {
            if existing_keys.contains(&peer.public_key) {
                continue;
            }
            let mut section = Section::new(SectionKind::Peer);
            section.push_field("PublicKey", FieldValue::Text(peer.public_key.clone()));
            doc.push_peer(section);
        }
        doc.order_peers_by_key(&wanted_keys, |section| section.get("PublicKey"));

        for peer in &hub_peers {
            for section in doc.peers_mut() {
                if section.get("PublicKey").as_deref() != Some(peer.public_key.as_str()) {
                    continue;
                }
                reconcile_peer_section(
                    section,
                    peer.psk.as_deref(),
                    &peer.allowed_ips,
                    peer.endpoint.as_deref(),
                    peer.keepalive,
                );
            }
        }

        let text = self.store_document("server", server.id, &doc)?;
        Ok(GeneratedConfig {
            name: format!("{}.conf", &*server.hostname),
            text,
            public_key: server.public_key.clone(),
        })
    }

    /// A subnet router's config: its interface plus a single hub peer.
    pub fn router_config(&self, router: &Router) -> Result<GeneratedConfig, Error> {
        let server = DatabaseServer::get(self.conn)?;
        let router_id = router.id;
        let db_router = DatabaseRouter::get(self.conn, router_id)?;
        let mut doc = self.load_document("router", router_id)?;

        let private_key = db_router
            .private_key(self.conn, self.vault)?
            .ok_or_else(|| {
                Error::validation(
                    "private_key",
                    format!(
                        "router {} is known only by its public key; cannot render its config",
                        router.hostname
                    ),
                )
            })?;

        let mut addresses = Vec::new();
        if let (Some(addr), Some(cidr)) = (router.ipv4_addr, server.ipv4_cidr) {
            addresses.push(format!("{}/{}", addr, cidr.prefix_len()));
        }
        if let (Some(addr), Some(cidr)) = (router.ipv6_addr, server.ipv6_cidr) {
            addresses.push(format!("{}/{}", addr, cidr.prefix_len()));
        }

        {
            let interface = doc.interface_mut();
            interface.set_if_changed("PrivateKey", FieldValue::Text(private_key));
            interface.set_if_changed("Address", FieldValue::list(addresses));
            let hooks = DatabaseHooks::list(self.conn, HookOwner::Router(router_id))?;
            Self::reconcile_hooks(interface, &hooks);
        }

        let hub_allowed: Vec<String> = server.vpn_cidrs().iter().map(|c| c.to_string()).collect();
        self.remap_rotated_keys(&mut doc)?;
        ensure_single_peer(&mut doc, &server.public_key);
        for section in doc.peers_mut() {
            reconcile_peer_section(
                section,
                None,
                &hub_allowed,
                Some(&server.endpoint.to_string()),
                Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
            );
        }

        let text = self.store_document("router", router_id, &doc)?;
        Ok(GeneratedConfig {
            name: format!("{}.conf", &*router.hostname),
            text,
            public_key: router.public_key.clone(),
        })
    }

    /// A remote's client config; peer composition follows its access level.
    pub fn remote_config(&self, remote: &Remote) -> Result<GeneratedConfig, Error> {
        let server = DatabaseServer::get(self.conn)?;
        let db_remote = DatabaseRemote::get(self.conn, remote.id)?;
        let mut doc = self.load_document("remote", remote.id)?;

        let private_key = db_remote
            .private_key(self.conn, self.vault)?
            .ok_or_else(|| {
                Error::validation(
                    "private_key",
                    format!(
                        "remote {} is provisional (public key only); its config lives with its owner",
                        remote.hostname
                    ),
                )
            })?;

        let advertised: Vec<ipnet::IpNet> = DatabaseRouter::list(self.conn)?
            .iter()
            .flat_map(|r| r.lans.clone())
            .collect();
        let entries = policy::remote_peer_entries(
            remote.access_level,
            &server.vpn_cidrs(),
            &advertised,
            &remote.lan_access,
            remote.custom_allowed_ips.as_deref(),
            remote.exit_node_id.is_some() || remote.exit_group_id.is_some(),
            remote.active_exit_id,
        )?;

        {
            let interface = doc.interface_mut();
            interface.set_if_changed("PrivateKey", FieldValue::Text(private_key));
            interface.set_if_changed(
                "Address",
                FieldValue::list(remote.addresses().iter().map(|a| a.to_string())),
            );
        }

        struct OutPeer {
            public_key: String,
            psk: Option<String>,
            allowed_ips: Vec<String>,
            endpoint: Option<String>,
            keepalive: Option<u16>,
        }
        let mut out_peers = Vec::new();
        for entry in entries {
            match entry {
                RemotePeerEntry::Hub { allowed_ips } => out_peers.push(OutPeer {
                    public_key: server.public_key.clone(),
                    psk: db_remote.preshared_key(self.conn, self.vault)?,
                    allowed_ips,
                    endpoint: Some(server.endpoint.to_string()),
                    keepalive: remote
                        .keepalive
                        .or(Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS)),
                }),
                RemotePeerEntry::Exit {
                    exit_id,
                    allowed_ips,
                } => {
                    let exit = DatabaseExit::get(self.conn, exit_id)?;
                    out_peers.push(OutPeer {
                        public_key: exit.public_key.clone(),
                        psk: None,
                        allowed_ips,
                        endpoint: Some(exit.endpoint.to_string()),
                        keepalive: remote.keepalive,
                    });
                },
            }
        }

        self.remap_rotated_keys(&mut doc)?;
        let wanted: Vec<String> = out_peers.iter().map(|p| p.public_key.clone()).collect();
        doc.retain_peers(|s| {
            s.get("PublicKey")
                .map(|key| wanted.contains(&key))
                .unwrap_or(false)
        });
        let existing: Vec<String> = doc.peers().filter_map(|s| s.get("PublicKey")).collect();
        for peer in &out_peers {
            if !existing.contains(&peer.public_key) {
                let mut section = Section::new(SectionKind::Peer);
                section.push_field("PublicKey", FieldValue::Text(peer.public_key.clone()));
                doc.push_peer(section);
            }
        }
        doc.order_peers_by_key(&wanted, |s| s.get("PublicKey"));
        for peer in &out_peers {
            for section in doc.peers_mut() {
                if section.get("PublicKey").as_deref() == Some(peer.public_key.as_str()) {
                    reconcile_peer_section(
                        section,
                        peer.psk.as_deref(),
                        &peer.allowed_ips,
                        peer.endpoint.as_deref(),
                        peer.keepalive,
                    );
                }
            }
        }

        let text = self.store_document("remote", remote.id, &doc)?;
        Ok(GeneratedConfig {
            name: format!("{}.conf", &*remote.hostname),
            text,
            public_key: remote.public_key.clone(),
        })
    }

    /// An exit node's config: NAT hooks plus one peer per remote using it.
    pub fn exit_config(&self, exit: &Exit) -> Result<GeneratedConfig, Error> {
        let db_exit = DatabaseExit::get(self.conn, exit.id)?;
        let mut doc = self.load_document("exit", exit.id)?;

        let private_key = db_exit.private_key(self.conn, self.vault)?.ok_or_else(|| {
            Error::validation(
                "private_key",
                format!("exit {} has no private key on file", exit.hostname),
            )
        })?;

        {
            let interface = doc.interface_mut();
            interface.set_if_changed("PrivateKey", FieldValue::Text(private_key));
            interface.set_if_changed(
                "Address",
                FieldValue::list(exit.addresses().iter().map(|a| a.to_string())),
            );
            interface.set_if_changed(
                "ListenPort",
                FieldValue::Text(exit.listen_port.to_string()),
            );
            let hooks = DatabaseHooks::list(self.conn, HookOwner::Exit(exit.id))?;
            Self::reconcile_hooks(interface, &hooks);
        }

        let users = DatabaseRemote::list_on_exit(self.conn, exit.id)?;
        self.remap_rotated_keys(&mut doc)?;
        let wanted: Vec<String> = users.iter().map(|r| r.public_key.clone()).collect();
        doc.retain_peers(|s| {
            s.get("PublicKey")
                .map(|key| wanted.contains(&key))
                .unwrap_or(false)
        });
        let existing: Vec<String> = doc.peers().filter_map(|s| s.get("PublicKey")).collect();
        for remote in &users {
            if !existing.contains(&remote.public_key) {
                let mut section = Section::new(SectionKind::Peer);
                section.push_field("PublicKey", FieldValue::Text(remote.public_key.clone()));
                doc.push_peer(section);
            }
        }
        doc.order_peers_by_key(&wanted, |s| s.get("PublicKey"));
        for remote in &users {
            let allowed: Vec<String> = remote.addresses().iter().map(|a| a.to_string()).collect();
            for section in doc.peers_mut() {
                if section.get("PublicKey").as_deref() == Some(remote.public_key.as_str()) {
                    reconcile_peer_section(section, None, &allowed, None, None);
                }
            }
        }

        let text = self.store_document("exit", exit.id, &doc)?;
        Ok(GeneratedConfig {
            name: format!("{}.conf", &*exit.hostname),
            text,
            public_key: exit.public_key.clone(),
        })
    }

    /// An extramural config: our interface plus only the active sponsor
    /// peer.
    pub fn extramural_config(
        &self,
        config: &ExtramuralConfig,
    ) -> Result<GeneratedConfig, Error> {
        let db_config = crate::db::DatabaseExtramuralConfig::get(self.conn, config.id)?;
        let mut doc = self.load_document("extramural_config", config.id)?;

        let active = DatabaseExtramuralPeer::active_for(self.conn, config.id)?.ok_or_else(
            || {
                Error::validation(
                    "peer",
                    format!(
                        "extramural config {} has no active peer",
                        config.interface_name
                    ),
                )
            },
        )?;

        let mut addresses = Vec::new();
        if let Some(addr) = config.ipv4_addr {
            addresses.push(format!("{addr}/32"));
        }
        if let Some(addr) = config.ipv6_addr {
            addresses.push(format!("{addr}/128"));
        }

        {
            let interface = doc.interface_mut();
            interface.set_if_changed(
                "PrivateKey",
                FieldValue::Text(db_config.private_key(self.conn, self.vault)?),
            );
            interface.set_if_changed("Address", FieldValue::list(addresses));
            if config.dns.is_empty() {
                interface.remove("DNS");
            } else {
                interface.set_if_changed(
                    "DNS",
                    FieldValue::list(config.dns.iter().map(|d| d.to_string())),
                );
            }
            match config.mtu {
                Some(mtu) => interface.set_if_changed("MTU", FieldValue::Text(mtu.to_string())),
                None => {
                    interface.remove("MTU");
                },
            }
            match config.listen_port {
                Some(port) => {
                    interface.set_if_changed("ListenPort", FieldValue::Text(port.to_string()))
                },
                None => {
                    interface.remove("ListenPort");
                },
            }
            let hooks = DatabaseHooks::list(self.conn, HookOwner::ExtramuralConfig(config.id))?;
            Self::reconcile_hooks(interface, &hooks);
        }

        ensure_single_peer(&mut doc, &active.public_key);
        let allowed: Vec<String> = active
            .allowed_ips
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let psk = active.preshared_key(self.conn, self.vault)?;
        for section in doc.peers_mut() {
            reconcile_peer_section(
                section,
                psk.as_deref(),
                &allowed,
                Some(&active.endpoint.to_string()),
                active.keepalive,
            );
        }

        let text = self.store_document("extramural_config", config.id, &doc)?;
        Ok(GeneratedConfig {
            name: format!("{}.conf", config.interface_name),
            text,
            public_key: config.public_key.clone(),
        })
    }

    /// Renders everything renderable: hub, routers, remotes, exits,
    /// extramural configs. Returns (entity label, config). Peers known
    /// only by their public key (provisional remotes, imported routers and
    /// exits whose own file never arrived) are skipped, not errors - their
    /// configs live with their owners.
    pub fn all_configs(&self) -> Result<Vec<(String, GeneratedConfig)>, Error> {
        fn keyless_skipped(
            out: &mut Vec<(String, GeneratedConfig)>,
            label: String,
            result: Result<GeneratedConfig, Error>,
        ) -> Result<(), Error> {
            match result {
                Ok(generated) => {
                    out.push((label, generated));
                    Ok(())
                },
                Err(Error::Validation { ref field, .. }) if field == "private_key" => {
                    log::debug!("{label}: no private key on file, skipping render");
                    Ok(())
                },
                Err(e) => Err(e),
            }
        }

        let mut out = Vec::new();
        out.push(("hub".to_string(), self.hub_config()?));
        for router in DatabaseRouter::list(self.conn)? {
            let label = format!("router/{}", &*router.hostname);
            keyless_skipped(&mut out, label, self.router_config(&router.inner))?;
        }
        for remote in DatabaseRemote::list(self.conn)? {
            let label = format!("remote/{}", &*remote.hostname);
            keyless_skipped(&mut out, label, self.remote_config(&remote.inner))?;
        }
        for exit in DatabaseExit::list(self.conn)? {
            let label = format!("exit/{}", &*exit.hostname);
            keyless_skipped(&mut out, label, self.exit_config(&exit.inner))?;
        }
        for config in crate::db::DatabaseExtramuralConfig::list(self.conn)? {
            let generated = self.extramural_config(&config.inner)?;
            let label = format!("extramural/{}", config.interface_name);
            out.push((label, generated));
        }
        Ok(out)
    }
}

/// Reconciles one peer section's fields in the canonical order: PublicKey,
/// PresharedKey?, AllowedIPs, Endpoint?, PersistentKeepalive?.
fn reconcile_peer_section(
    section: &mut Section,
    psk: Option<&str>,
    allowed_ips: &[String],
    endpoint: Option<&str>,
    keepalive: Option<u16>,
) {
    match psk {
        Some(psk) => section.set_if_changed("PresharedKey", FieldValue::Text(psk.to_string())),
        None => {
            section.remove("PresharedKey");
        },
    }
    section.set_if_changed("AllowedIPs", FieldValue::list(allowed_ips.to_vec()));
    match endpoint {
        Some(endpoint) => {
            section.set_if_changed("Endpoint", FieldValue::Text(endpoint.to_string()))
        },
        None => {
            section.remove("Endpoint");
        },
    }
    match keepalive {
        Some(secs) => {
            section.set_if_changed("PersistentKeepalive", FieldValue::Text(secs.to_string()))
        },
        None => {
            section.remove("PersistentKeepalive");
        },
    }
}

/// Shrinks the document to exactly one peer with the given public key,
/// creating it if needed. Used for configs whose contract is "one peer
/// only" (router -> hub, extramural -> active sponsor peer).
fn ensure_single_peer(doc: &mut ConfDocument, public_key: &str) {
    let mut seen = false;
    doc.retain_peers(|s| {
        let keep = !seen && s.get("PublicKey").as_deref() == Some(public_key);
        if keep {
            seen = true;
        }
        keep
    });
    if !seen {
        let mut section = Section::new(SectionKind::Peer);
        section.push_field("PublicKey", FieldValue::Text(public_key.to_string()));
        doc.push_peer(section);
    }
}
