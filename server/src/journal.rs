//! The state-change journal: typed service-layer operations.
//!
//! Every operation here is one unit: it runs in a single IMMEDIATE
//! transaction on the writer connection, emits exactly one audit entry
//! inside that transaction, and publishes one event to the in-process bus
//! after commit. Subscribers (alert dispatcher, log) never run inside the
//! transaction and can never block or fail a mutation.

use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::Transaction;
use serde::Serialize;
use serde_json::json;
use wgfleet_conf::KeyPair;
use wgfleet_shared::{
    cli::{
        AddExitGroupOpts, AddExitOpts, AddLocalPeerOpts, AddRemoteOpts, AddRouterOpts,
        AddSponsorOpts, AddSshHostOpts, ExtramuralAddPeerOpts, ImportOpts,
    },
    hooks::{HookCommand, HookDirection, HookTemplate},
    AccessLevel, Endpoint, Exit, ExitContents, ExitGroup, ExitGroupContents, Hostname, LocalPeer,
    Remote, RemoteContents, Router, RouterContents, ServerContents, Sponsor, SshHost,
    SshHostContents,
};

use crate::{
    alloc,
    audit::{AuditEvent, AuditLog, Severity},
    db::{
        self, DatabaseConfigDocument, DatabaseExit, DatabaseExitGroup, DatabaseExtramuralConfig,
        DatabaseExtramuralPeer, DatabaseHooks, DatabaseLocalPeer, DatabaseRemote, DatabaseRouter,
        DatabaseServer, DatabaseSponsor, DatabaseSshHost, HookOwner,
    },
    import::{self, ImportSummary},
    vault::{self, Vault},
    Context, Error,
};

/// Events published after a committed mutation. Structured so webhook
/// payloads and alert rules can match on them.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    FleetImported {
        hub: String,
        peers: usize,
    },
    PeerAdded {
        kind: String,
        name: String,
    },
    PeerRemoved {
        kind: String,
        name: String,
    },
    KeysRotated {
        kind: String,
        name: String,
    },
    AccessLevelChanged {
        name: String,
        level: String,
    },
    PskChanged {
        name: String,
        removed: bool,
    },
    ExitAssigned {
        remote: String,
        exit: Option<String>,
    },
    FailoverOccurred {
        group_id: i64,
        moved_remotes: usize,
        to_exit_id: Option<i64>,
        reason: String,
    },
    ConfigsGenerated {
        count: usize,
    },
    Deployed {
        target: String,
        success: bool,
        error: Option<String>,
    },
    ExtramuralPeerSwitched {
        config: String,
        peer: String,
    },
    ExtramuralImported {
        config: String,
        peers: usize,
    },
    RemoteUpdateConfirmed {
        config: String,
    },
    PassphraseChanged,
    BackupCreated {
        path: String,
    },
    BackupRestored {
        path: String,
    },
}

impl Event {
    /// Name used by alert rules and webhook payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::FleetImported { .. } => "fleet_imported",
            Event::PeerAdded { .. } => "peer_added",
            Event::PeerRemoved { .. } => "peer_removed",
            Event::KeysRotated { .. } => "keys_rotated",
            Event::AccessLevelChanged { .. } => "access_level_changed",
            Event::PskChanged { .. } => "psk_changed",
            Event::ExitAssigned { .. } => "exit_assigned",
            Event::FailoverOccurred { .. } => "failover_occurred",
            Event::ConfigsGenerated { .. } => "configs_generated",
            Event::Deployed { .. } => "deployed",
            Event::ExtramuralPeerSwitched { .. } => "extramural_peer_switched",
            Event::ExtramuralImported { .. } => "extramural_imported",
            Event::RemoteUpdateConfirmed { .. } => "remote_update_confirmed",
            Event::PassphraseChanged => "passphrase_changed",
            Event::BackupCreated { .. } => "backup_created",
            Event::BackupRestored { .. } => "backup_restored",
        }
    }
}

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// In-process fan-out of journal events.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.write().push(subscriber);
    }

    pub fn publish(&self, event: &Event) {
        log::debug!("event: {}", event.kind());
        for subscriber in self.subscribers.read().iter() {
            subscriber(event);
        }
    }
}

/// Runs one mutating unit: transaction, audit entry, commit, event.
fn mutate<T>(
    ctx: &Context,
    f: impl FnOnce(&Transaction, &Vault) -> Result<(T, AuditEvent, Event), Error>,
) -> Result<T, Error> {
    let mut guard = ctx.db.lock();
    let tx = db::immediate(&mut guard)?;
    let (value, audit_event, event) = f(&tx, &ctx.vault)?;
    AuditLog::append(&tx, audit_event)?;
    tx.commit()?;
    drop(guard);
    ctx.bus.publish(&event);
    Ok(value)
}

pub fn import_fleet(ctx: &Context, opts: &ImportOpts) -> Result<ImportSummary, Error> {
    let dir = opts
        .dir
        .clone()
        .unwrap_or_else(|| ctx.store.import_dir());
    let endpoint: Option<Endpoint> = opts
        .endpoint
        .as_deref()
        .map(|e| e.parse().map_err(|m: &str| Error::validation("endpoint", m)))
        .transpose()?;
    let operator = ctx.operator();
    mutate(ctx, |tx, vault| {
        let summary = import::import_directory(
            tx,
            vault,
            &dir,
            endpoint,
            opts.hostname.clone(),
            opts.strict,
        )?;
        let peers = summary.routers + summary.remotes + summary.exits;
        let audit = AuditEvent::new("fleet_imported", "topology", &operator).details(json!({
            "hub": summary.hub,
            "routers": summary.routers,
            "remotes": summary.remotes,
            "exits": summary.exits,
        }));
        let event = Event::FleetImported {
            hub: summary.hub.clone(),
            peers,
        };
        Ok((summary, audit, event))
    })
}

/// Initializes a fresh topology (the `init` wizard's workhorse).
#[allow(clippy::too_many_arguments)]
pub fn init_topology(
    ctx: &Context,
    hostname: Hostname,
    endpoint: Endpoint,
    ipv4_cidr: Option<ipnet::Ipv4Net>,
    ipv6_cidr: Option<ipnet::Ipv6Net>,
    listen_port: u16,
) -> Result<crate::db::DatabaseServer, Error> {
    let operator = ctx.operator();
    mutate(ctx, |tx, vault| {
        let keypair = KeyPair::generate();
        let ipv4_addr = ipv4_cidr.map(|c| {
            let mut host = u32::from(c.network());
            host += 1;
            std::net::Ipv4Addr::from(host)
        });
        let ipv6_addr = ipv6_cidr.map(|c| {
            let mut host = u128::from(c.network());
            host += 1;
            std::net::Ipv6Addr::from(host)
        });
        let server = DatabaseServer::create(
            tx,
            vault,
            ServerContents {
                hostname: hostname.clone(),
                endpoint,
                ipv4_cidr,
                ipv6_cidr,
                ipv4_addr,
                ipv6_addr,
                public_key: keypair.public.to_base64(),
                permanent_guid: String::new(),
                listen_port,
                mtu: None,
                ssh_host_id: None,
            },
            &keypair.private.to_base64(),
        )?;
        let audit = AuditEvent::new("hub_created", "topology", &operator)
            .entity("server", server.id, &server.permanent_guid)
            .details(json!({ "hostname": &*hostname }));
        let event = Event::PeerAdded {
            kind: "hub".to_string(),
            name: (*hostname).clone(),
        };
        Ok((server, audit, event))
    })
}

fn allocate_addresses(
    tx: &Transaction,
    server: &DatabaseServer,
    category: &str,
    requested: Option<std::net::IpAddr>,
) -> Result<(Option<std::net::Ipv4Addr>, Option<std::net::Ipv6Addr>), Error> {
    use std::collections::HashSet;
    use std::net::IpAddr;

    let all_used: HashSet<IpAddr> = DatabaseServer::used_addresses(tx)?.into_iter().collect();

    if let Some(addr) = requested {
        let in_range = match addr {
            IpAddr::V4(a) => server.ipv4_cidr.map(|c| c.contains(&a)).unwrap_or(false),
            IpAddr::V6(a) => server.ipv6_cidr.map(|c| c.contains(&a)).unwrap_or(false),
        };
        if !in_range {
            return Err(Error::validation(
                "ip",
                format!("{addr} is outside the hub's network ranges"),
            ));
        }
        if all_used.contains(&addr) {
            return Err(Error::Conflict(format!("VPN address {addr} already assigned")));
        }
        return Ok(match addr {
            IpAddr::V4(a) => (Some(a), None),
            IpAddr::V6(a) => (None, Some(a)),
        });
    }

    let mut category_v4 = Vec::new();
    let mut category_v6 = Vec::new();
    let mut stmt = tx.prepare(&format!("SELECT ipv4_addr, ipv6_addr FROM {category}"))?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, Option<String>>(1)?,
        ))
    })?;
    for row in rows {
        let (v4, v6) = row?;
        if let Some(a) = v4.and_then(|s| s.parse().ok()) {
            category_v4.push(a);
        }
        if let Some(a) = v6.and_then(|s| s.parse().ok()) {
            category_v6.push(a);
        }
    }

    let v4 = server
        .ipv4_cidr
        .map(|cidr| alloc::next_free_v4(cidr, &category_v4, &all_used))
        .transpose()?;
    let v6 = server
        .ipv6_cidr
        .map(|cidr| alloc::next_free_v6(cidr, &category_v6, &all_used))
        .transpose()?;
    Ok((v4, v6))
}

/// Outcome of adding a keyed peer: the entity plus, when we generated the
/// key pair ourselves, the private key the operator must hand to the
/// device.
pub struct NewPeer<T> {
    pub entity: T,
    pub keypair: Option<KeyPair>,
    pub preshared_key: Option<String>,
}

pub fn add_remote(ctx: &Context, opts: &AddRemoteOpts) -> Result<NewPeer<Remote>, Error> {
    let name: Hostname = opts
        .name
        .clone()
        .ok_or_else(|| Error::validation("name", "a remote needs a name"))?
        .parse()
        .map_err(|e: &str| Error::validation("name", e))?;
    let operator = ctx.operator();
    let opts = opts.clone();
    mutate(ctx, move |tx, vault| {
        let server = DatabaseServer::get(tx)?;
        let (ipv4, ipv6) = allocate_addresses(tx, &server, "remotes", opts.ip)?;

        let (public_key, keypair) = match &opts.public_key {
            Some(key) => {
                wgfleet_conf::Key::from_base64(key)?;
                (key.clone(), None)
            },
            None => {
                let pair = KeyPair::generate();
                (pair.public.to_base64(), Some(pair))
            },
        };
        let preshared_key = opts
            .psk
            .then(|| wgfleet_conf::Key::generate_preshared().to_base64());

        let exit_node_id = opts
            .exit
            .as_deref()
            .map(|name| DatabaseExit::get_by_name(tx, name).map(|e| e.id))
            .transpose()?;
        let exit_group_id = opts
            .exit_group
            .as_deref()
            .map(|name| DatabaseExitGroup::get_by_name(tx, name).map(|g| g.id))
            .transpose()?;
        let active_exit_id = match (exit_node_id, exit_group_id) {
            (Some(id), _) => Some(id),
            (None, Some(group_id)) => first_enabled_member(tx, group_id)?,
            (None, None) => None,
        };

        let remote = DatabaseRemote::create(
            tx,
            vault,
            RemoteContents {
                server_id: server.id,
                hostname: name.clone(),
                ipv4_addr: ipv4,
                ipv6_addr: ipv6,
                public_key,
                permanent_guid: String::new(),
                access_level: opts.access_level,
                lan_access: opts.lans.clone(),
                custom_allowed_ips: opts.allowed_ips.clone(),
                exit_node_id,
                exit_group_id,
                active_exit_id,
                has_psk: preshared_key.is_some(),
                keepalive: None,
                last_rotated_at: None,
            },
            keypair.as_ref().map(|p| p.private.to_base64()).as_deref(),
            preshared_key.as_deref(),
        )?;

        let audit = AuditEvent::new("remote_added", "topology", &operator)
            .entity("remote", remote.id, &remote.permanent_guid)
            .details(json!({
                "hostname": &*name,
                "access_level": opts.access_level.as_str(),
                "ipv4": ipv4.map(|a| a.to_string()),
                "ipv6": ipv6.map(|a| a.to_string()),
            }));
        let event = Event::PeerAdded {
            kind: "remote".to_string(),
            name: (*name).clone(),
        };
        Ok((
            NewPeer {
                entity: remote.inner,
                keypair,
                preshared_key,
            },
            audit,
            event,
        ))
    })
}

fn first_enabled_member(tx: &Transaction, group_id: i64) -> Result<Option<i64>, Error> {
    let group = DatabaseExitGroup::get(tx, group_id)?;
    Ok(group
        .members(tx)?
        .iter()
        .find(|m| m.enabled)
        .map(|m| m.exit_id))
}

pub fn add_router(ctx: &Context, opts: &AddRouterOpts) -> Result<NewPeer<Router>, Error> {
    let name: Hostname = opts
        .name
        .clone()
        .ok_or_else(|| Error::validation("name", "a router needs a name"))?
        .parse()
        .map_err(|e: &str| Error::validation("name", e))?;
    let operator = ctx.operator();
    let opts = opts.clone();
    mutate(ctx, move |tx, vault| {
        let server = DatabaseServer::get(tx)?;
        let (ipv4, ipv6) = allocate_addresses(tx, &server, "routers", opts.ip)?;
        let endpoint: Option<Endpoint> = opts
            .endpoint
            .as_deref()
            .map(|e| e.parse().map_err(|m: &str| Error::validation("endpoint", m)))
            .transpose()?;
        let ssh_host_id = opts
            .ssh_host
            .as_deref()
            .map(|name| DatabaseSshHost::get_by_name(tx, name).map(|h| h.id))
            .transpose()?;
        let keypair = KeyPair::generate();

        let mut allowed = Vec::new();
        if let Some(a) = ipv4 {
            allowed.push(format!("{a}/32"));
        }
        if let Some(a) = ipv6 {
            allowed.push(format!("{a}/128"));
        }
        allowed.extend(opts.lans.iter().map(|l| l.to_string()));

        let router = DatabaseRouter::create(
            tx,
            vault,
            RouterContents {
                server_id: server.id,
                hostname: name.clone(),
                ipv4_addr: ipv4,
                ipv6_addr: ipv6,
                endpoint,
                has_endpoint: false,
                lans: opts.lans.clone(),
                allowed_ips: allowed.join(", "),
                public_key: keypair.public.to_base64(),
                permanent_guid: String::new(),
                ssh_host_id,
            },
            Some(&keypair.private.to_base64()),
        )?;

        let audit = AuditEvent::new("router_added", "topology", &operator)
            .entity("router", router.id, &router.permanent_guid)
            .details(json!({
                "hostname": &*name,
                "lans": opts.lans.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
            }));
        let event = Event::PeerAdded {
            kind: "router".to_string(),
            name: (*name).clone(),
        };
        Ok((
            NewPeer {
                entity: router.inner,
                keypair: Some(keypair),
                preshared_key: None,
            },
            audit,
            event,
        ))
    })
}

pub fn add_exit(ctx: &Context, opts: &AddExitOpts) -> Result<NewPeer<Exit>, Error> {
    let name: Hostname = opts
        .name
        .clone()
        .ok_or_else(|| Error::validation("name", "an exit needs a name"))?
        .parse()
        .map_err(|e: &str| Error::validation("name", e))?;
    let endpoint: Endpoint = opts
        .endpoint
        .clone()
        .ok_or_else(|| Error::validation("endpoint", "an exit needs a public endpoint"))?
        .parse()
        .map_err(|m: &str| Error::validation("endpoint", m))?;
    let operator = ctx.operator();
    let opts = opts.clone();
    mutate(ctx, move |tx, vault| {
        let server = DatabaseServer::get(tx)?;
        let (ipv4, ipv6) = allocate_addresses(tx, &server, "exits", opts.ip)?;
        let keypair = KeyPair::generate();

        let exit = DatabaseExit::create(
            tx,
            vault,
            ExitContents {
                server_id: server.id,
                hostname: name.clone(),
                endpoint: endpoint.clone(),
                listen_port: opts.listen_port,
                ipv4_addr: ipv4,
                ipv6_addr: ipv6,
                public_key: keypair.public.to_base64(),
                permanent_guid: String::new(),
                ssh_host_id: None,
            },
            Some(&keypair.private.to_base64()),
        )?;

        // Exit NAT is system-originated: parameterized templates, not
        // opaque strings, so later regeneration can rewrite them.
        let hooks = vec![
            HookCommand::template(
                HookDirection::PostUp,
                0,
                HookTemplate::ExitNat {
                    wan_interface: opts.wan_interface.clone(),
                },
            ),
            HookCommand::template(
                HookDirection::PostDown,
                1,
                HookTemplate::ExitNat {
                    wan_interface: opts.wan_interface.clone(),
                },
            ),
        ];
        DatabaseHooks::replace(tx, HookOwner::Exit(exit.id), &hooks)?;

        if let Some(group_name) = &opts.group {
            let group = DatabaseExitGroup::get_by_name(tx, group_name)?;
            let next_priority = group.members(tx)?.len() as i64;
            group.add_member(tx, exit.id, next_priority, 1)?;
        }

        let audit = AuditEvent::new("exit_added", "topology", &operator)
            .entity("exit", exit.id, &exit.permanent_guid)
            .details(json!({ "hostname": &*name, "endpoint": endpoint.to_string() }));
        let event = Event::PeerAdded {
            kind: "exit".to_string(),
            name: (*name).clone(),
        };
        Ok((
            NewPeer {
                entity: exit.inner,
                keypair: Some(keypair),
                preshared_key: None,
            },
            audit,
            event,
        ))
    })
}

pub fn add_exit_group(ctx: &Context, opts: &AddExitGroupOpts) -> Result<ExitGroup, Error> {
    let name = opts
        .name
        .clone()
        .ok_or_else(|| Error::validation("name", "an exit group needs a name"))?;
    let operator = ctx.operator();
    let opts = opts.clone();
    mutate(ctx, move |tx, _vault| {
        let group = DatabaseExitGroup::create(
            tx,
            ExitGroupContents {
                name: name.clone(),
                strategy: opts.strategy,
                check_interval_secs: opts.check_interval,
                check_timeout_secs: opts.check_timeout,
            },
        )?;
        let audit = AuditEvent::new("exit_group_added", "failover", &operator).details(json!({
            "name": name,
            "strategy": opts.strategy.as_str(),
        }));
        let event = Event::PeerAdded {
            kind: "exit-group".to_string(),
            name: name.clone(),
        };
        Ok((group.inner, audit, event))
    })
}

pub fn add_ssh_host(ctx: &Context, opts: &AddSshHostOpts) -> Result<SshHost, Error> {
    let name = opts
        .name
        .clone()
        .ok_or_else(|| Error::validation("name", "an ssh host needs a name"))?;
    let host = opts
        .host
        .clone()
        .ok_or_else(|| Error::validation("host", "an ssh host needs an address"))?;
    let operator = ctx.operator();
    let opts = opts.clone();
    mutate(ctx, move |tx, _vault| {
        let created = DatabaseSshHost::create(
            tx,
            SshHostContents {
                name: name.clone(),
                host,
                port: opts.port,
                user: opts.user.clone(),
                key_path: opts.key_path.clone(),
                config_dir: opts.config_dir.clone(),
            },
        )?;
        let audit = AuditEvent::new("ssh_host_added", "deployment", &operator)
            .details(json!({ "name": name }));
        let event = Event::PeerAdded {
            kind: "ssh-host".to_string(),
            name: name.clone(),
        };
        Ok((created.inner, audit, event))
    })
}

pub fn add_sponsor(ctx: &Context, opts: &AddSponsorOpts) -> Result<Sponsor, Error> {
    let name = opts
        .name
        .clone()
        .ok_or_else(|| Error::validation("name", "a sponsor needs a name"))?;
    let operator = ctx.operator();
    let website = opts.website.clone();
    mutate(ctx, move |tx, _vault| {
        let sponsor = DatabaseSponsor::create(tx, &name, website.as_deref())?;
        let audit = AuditEvent::new("sponsor_added", "extramural", &operator)
            .details(json!({ "name": name }));
        let event = Event::PeerAdded {
            kind: "sponsor".to_string(),
            name,
        };
        Ok((sponsor, audit, event))
    })
}

pub fn add_local_peer(ctx: &Context, opts: &AddLocalPeerOpts) -> Result<LocalPeer, Error> {
    let name = opts
        .name
        .clone()
        .ok_or_else(|| Error::validation("name", "a local peer needs a name"))?;
    let operator = ctx.operator();
    let ssh_host = opts.ssh_host.clone();
    mutate(ctx, move |tx, _vault| {
        let ssh_host_id = ssh_host
            .as_deref()
            .map(|name| DatabaseSshHost::get_by_name(tx, name).map(|h| h.id))
            .transpose()?;
        let peer = DatabaseLocalPeer::create(tx, &name, ssh_host_id)?;
        let audit = AuditEvent::new("local_peer_added", "extramural", &operator)
            .details(json!({ "name": name }));
        let event = Event::PeerAdded {
            kind: "local-peer".to_string(),
            name,
        };
        Ok((peer, audit, event))
    })
}

pub fn remove_entity(ctx: &Context, kind: &str, name: &str) -> Result<(), Error> {
    let operator = ctx.operator();
    let kind = kind.to_string();
    let name = name.to_string();
    mutate(ctx, move |tx, _vault| {
        match kind.as_str() {
            "remote" => {
                let remote = DatabaseRemote::get_by_name(tx, &name)?;
                DatabaseRemote::delete(tx, remote.id)?;
                DatabaseConfigDocument::delete(tx, "remote", remote.id)?;
            },
            "router" => {
                let router = DatabaseRouter::get_by_name(tx, &name)?;
                DatabaseRouter::delete(tx, router.id)?;
                DatabaseConfigDocument::delete(tx, "router", router.id)?;
            },
            "exit" => {
                let exit = DatabaseExit::get_by_name(tx, &name)?;
                DatabaseExit::delete(tx, exit.id)?;
                DatabaseConfigDocument::delete(tx, "exit", exit.id)?;
            },
            "exit-group" => {
                let group = DatabaseExitGroup::get_by_name(tx, &name)?;
                DatabaseExitGroup::delete(tx, group.id)?;
            },
            "sponsor" => {
                let sponsor = DatabaseSponsor::get_by_name(tx, &name)?;
                DatabaseSponsor::delete(tx, sponsor.id)?;
            },
            "local-peer" => {
                let peer = DatabaseLocalPeer::get_by_name(tx, &name)?;
                DatabaseLocalPeer::delete(tx, peer.id)?;
            },
            "ssh-host" => {
                let host = DatabaseSshHost::get_by_name(tx, &name)?;
                DatabaseSshHost::delete(tx, host.id)?;
            },
            other => {
                return Err(Error::validation(
                    "kind",
                    format!("unknown entity kind {other}"),
                ))
            },
        }
        let audit = AuditEvent::new("entity_removed", "topology", &operator)
            .severity(Severity::Warning)
            .details(json!({ "kind": kind, "name": name }));
        let event = Event::PeerRemoved {
            kind: kind.clone(),
            name: name.clone(),
        };
        Ok(((), audit, event))
    })
}

/// Rotates keys for `kind/name`, or the hub when `entity` is `None`. The
/// permanent GUID never changes; history records the transition.
pub fn rotate_keys(ctx: &Context, entity: Option<&str>, reason: &str) -> Result<KeyPair, Error> {
    let operator = ctx.operator();
    let entity = entity.map(str::to_string);
    let reason = reason.to_string();
    mutate(ctx, move |tx, vault| {
        let keypair = KeyPair::generate();
        let (kind, name, guid, id) = match entity.as_deref() {
            None | Some("hub") | Some("server") => {
                let mut server = DatabaseServer::get(tx)?;
                server.rotate_keys(tx, vault, &keypair, &reason)?;
                (
                    "hub".to_string(),
                    (*server.hostname).clone(),
                    server.permanent_guid.clone(),
                    server.id,
                )
            },
            Some(spec) => {
                let (kind, name) = spec.split_once('/').ok_or_else(|| {
                    Error::validation("entity", "expected <kind>/<name>, e.g. remote/carol")
                })?;
                match kind {
                    "remote" => {
                        let mut remote = DatabaseRemote::get_by_name(tx, name)?;
                        remote.rotate_keys(tx, vault, &keypair, &reason)?;
                        (
                            kind.to_string(),
                            name.to_string(),
                            remote.permanent_guid.clone(),
                            remote.id,
                        )
                    },
                    "router" => {
                        let mut router = DatabaseRouter::get_by_name(tx, name)?;
                        router.rotate_keys(tx, vault, &keypair, &reason)?;
                        (
                            kind.to_string(),
                            name.to_string(),
                            router.permanent_guid.clone(),
                            router.id,
                        )
                    },
                    "exit" => {
                        let mut exit = DatabaseExit::get_by_name(tx, name)?;
                        exit.rotate_keys(tx, vault, &keypair, &reason)?;
                        (
                            kind.to_string(),
                            name.to_string(),
                            exit.permanent_guid.clone(),
                            exit.id,
                        )
                    },
                    "extramural" => {
                        let mut config = DatabaseExtramuralConfig::get_by_ref(tx, name)?;
                        config.rotate_keys(tx, vault, &keypair, &reason)?;
                        (
                            kind.to_string(),
                            name.to_string(),
                            config.permanent_guid.clone(),
                            config.id,
                        )
                    },
                    other => {
                        return Err(Error::validation(
                            "entity",
                            format!("cannot rotate keys for kind {other}"),
                        ))
                    },
                }
            },
        };
        let audit = AuditEvent::new("keys_rotated", "identity", &operator)
            .entity(&kind, id, &guid)
            .details(json!({ "name": name, "reason": reason }));
        let event = Event::KeysRotated { kind, name };
        Ok((keypair, audit, event))
    })
}

pub fn set_access_level(
    ctx: &Context,
    remote_name: &str,
    level: AccessLevel,
    lans: Vec<ipnet::IpNet>,
    custom_allowed_ips: Option<String>,
) -> Result<Remote, Error> {
    let operator = ctx.operator();
    let remote_name = remote_name.to_string();
    mutate(ctx, move |tx, _vault| {
        let mut remote = DatabaseRemote::get_by_name(tx, &remote_name)?;
        let contents = RemoteContents {
            access_level: level,
            lan_access: lans.clone(),
            custom_allowed_ips: custom_allowed_ips.clone(),
            ..remote.contents.clone()
        };
        remote.update(tx, contents)?;
        let audit = AuditEvent::new("access_level_changed", "policy", &operator)
            .entity("remote", remote.id, &remote.permanent_guid)
            .details(json!({ "name": remote_name, "level": level.as_str() }));
        let event = Event::AccessLevelChanged {
            name: remote_name.clone(),
            level: level.as_str().to_string(),
        };
        Ok((remote.inner, audit, event))
    })
}

/// Generates or removes a remote's preshared key. Returns the new key so
/// the operator can install it on the device.
pub fn set_psk(ctx: &Context, remote_name: &str, remove: bool) -> Result<Option<String>, Error> {
    let operator = ctx.operator();
    let remote_name = remote_name.to_string();
    mutate(ctx, move |tx, vault| {
        let mut remote = DatabaseRemote::get_by_name(tx, &remote_name)?;
        let psk = if remove {
            None
        } else {
            Some(wgfleet_conf::Key::generate_preshared().to_base64())
        };
        remote.set_preshared_key(tx, vault, psk.as_deref())?;
        let audit = AuditEvent::new("psk_changed", "identity", &operator)
            .entity("remote", remote.id, &remote.permanent_guid)
            .details(json!({ "name": remote_name, "removed": remove }));
        let event = Event::PskChanged {
            name: remote_name.clone(),
            removed: remove,
        };
        Ok((psk, audit, event))
    })
}

pub fn assign_exit(
    ctx: &Context,
    remote_name: &str,
    exit: Option<&str>,
    group: Option<&str>,
) -> Result<Remote, Error> {
    let operator = ctx.operator();
    let remote_name = remote_name.to_string();
    let exit = exit.map(str::to_string);
    let group = group.map(str::to_string);
    mutate(ctx, move |tx, _vault| {
        let mut remote = DatabaseRemote::get_by_name(tx, &remote_name)?;
        let (exit_node_id, exit_group_id, active, exit_label) = match (&exit, &group) {
            (Some(name), _) => {
                let e = DatabaseExit::get_by_name(tx, name)?;
                (Some(e.id), None, Some(e.id), Some((*e.hostname).clone()))
            },
            (None, Some(name)) => {
                let g = DatabaseExitGroup::get_by_name(tx, name)?;
                let first = first_enabled_member(tx, g.id)?;
                (None, Some(g.id), first, Some(g.name.clone()))
            },
            (None, None) => (None, None, None, None),
        };
        let contents = RemoteContents {
            exit_node_id,
            exit_group_id,
            active_exit_id: active,
            ..remote.contents.clone()
        };
        remote.update(tx, contents)?;
        let audit = AuditEvent::new("exit_assigned", "failover", &operator)
            .entity("remote", remote.id, &remote.permanent_guid)
            .details(json!({ "name": remote_name, "exit": exit_label }));
        let event = Event::ExitAssigned {
            remote: remote_name.clone(),
            exit: exit_label,
        };
        Ok((remote.inner, audit, event))
    })
}

/// Operator-forced failover for one group. The reassignment itself commits
/// in the controller's transaction; the operator action is audited as its
/// own unit afterwards.
pub fn force_failover(
    ctx: &Context,
    group_name: &str,
    reason: &str,
) -> Result<Vec<crate::failover::FailoverDecision>, Error> {
    let group_id = {
        let guard = ctx.db.lock();
        DatabaseExitGroup::get_by_name(&guard, group_name)?.id
    };
    let decisions = {
        let mut guard = ctx.db.lock();
        crate::failover::run_group_decision(
            &mut guard,
            group_id,
            &std::collections::HashMap::new(),
            reason,
        )?
    };

    let operator = ctx.operator();
    let group_name = group_name.to_string();
    let reason = reason.to_string();
    let moved = decisions.len();
    let to_exit_id = decisions.first().and_then(|d| d.to_exit_id);
    mutate(ctx, move |_tx, _vault| {
        let audit = AuditEvent::new("failover_forced", "failover", &operator)
            .severity(Severity::Warning)
            .details(json!({ "group": group_name, "reason": reason, "moved": moved }));
        let event = Event::FailoverOccurred {
            group_id,
            moved_remotes: moved,
            to_exit_id,
            reason: reason.clone(),
        };
        Ok(((), audit, event))
    })?;
    Ok(decisions)
}

pub fn switch_extramural_peer(
    ctx: &Context,
    config_ref: &str,
    peer_name: &str,
) -> Result<(), Error> {
    let operator = ctx.operator();
    let config_ref = config_ref.to_string();
    let peer_name = peer_name.to_string();
    mutate(ctx, move |tx, _vault| {
        let config = DatabaseExtramuralConfig::get_by_ref(tx, &config_ref)?;
        let peer = DatabaseExtramuralPeer::get_by_name(tx, config.id, &peer_name)?;
        DatabaseExtramuralPeer::activate(tx, peer.id)?;
        let audit = AuditEvent::new("extramural_peer_switched", "extramural", &operator)
            .entity("extramural_config", config.id, &config.permanent_guid)
            .details(json!({ "config": config_ref, "peer": peer_name }));
        let event = Event::ExtramuralPeerSwitched {
            config: config_ref.clone(),
            peer: peer_name.clone(),
        };
        Ok(((), audit, event))
    })
}

pub fn add_extramural_peer(
    ctx: &Context,
    opts: &ExtramuralAddPeerOpts,
) -> Result<(), Error> {
    let operator = ctx.operator();
    let opts = opts.clone();
    mutate(ctx, move |tx, vault| {
        let config = DatabaseExtramuralConfig::get_by_ref(tx, &opts.config)?;
        wgfleet_conf::Key::from_base64(&opts.public_key)?;
        let endpoint: Endpoint = opts
            .endpoint
            .parse()
            .map_err(|m: &str| Error::validation("endpoint", m))?;
        DatabaseExtramuralPeer::create(
            tx,
            vault,
            wgfleet_shared::ExtramuralPeerContents {
                config_id: config.id,
                name: opts.name.clone(),
                public_key: opts.public_key.clone(),
                endpoint,
                allowed_ips: opts.allowed_ips.clone(),
                has_psk: false,
                keepalive: opts.keepalive,
                is_active: opts.activate,
            },
            None,
        )?;
        let audit = AuditEvent::new("extramural_peer_added", "extramural", &operator)
            .entity("extramural_config", config.id, &config.permanent_guid)
            .details(json!({ "config": opts.config, "peer": opts.name }));
        let event = Event::PeerAdded {
            kind: "extramural-peer".to_string(),
            name: opts.name.clone(),
        };
        Ok(((), audit, event))
    })
}

/// Imports a sponsor-provided `.conf` as a new extramural config.
pub fn import_extramural(
    ctx: &Context,
    local_peer: &str,
    sponsor: &str,
    path: &std::path::Path,
    interface_name: Option<&str>,
) -> Result<ExtramuralImportSummary, Error> {
    let text = std::fs::read_to_string(path)?;
    let doc = wgfleet_conf::parse(&text)?;
    let operator = ctx.operator();
    let local_peer = local_peer.to_string();
    let sponsor = sponsor.to_string();
    let interface_name = interface_name
        .map(str::to_string)
        .or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "wg-extramural".to_string());

    mutate(ctx, move |tx, vault| {
        let peer_row = DatabaseLocalPeer::get_by_name(tx, &local_peer)?;
        let sponsor_row = DatabaseSponsor::get_by_name(tx, &sponsor)?;

        let private_key = doc.interface().get("PrivateKey").ok_or_else(|| {
            Error::validation("PrivateKey", "sponsor config has no PrivateKey")
        })?;
        let public_key = wgfleet_conf::Key::from_base64(&private_key)?
            .get_public()
            .to_base64();

        let mut ipv4_addr = None;
        let mut ipv6_addr = None;
        if let Some(field) = doc.interface().field("Address") {
            for item in field.value.items() {
                if let Ok(net) = item.parse::<ipnet::IpNet>() {
                    match net.addr() {
                        std::net::IpAddr::V4(a) => ipv4_addr = Some(a),
                        std::net::IpAddr::V6(a) => ipv6_addr = Some(a),
                    }
                } else if let Ok(addr) = item.parse::<std::net::IpAddr>() {
                    match addr {
                        std::net::IpAddr::V4(a) => ipv4_addr = Some(a),
                        std::net::IpAddr::V6(a) => ipv6_addr = Some(a),
                    }
                }
            }
        }
        let dns = doc
            .interface()
            .field("DNS")
            .map(|f| {
                f.value
                    .items()
                    .iter()
                    .filter_map(|i| i.parse().ok())
                    .collect()
            })
            .unwrap_or_default();

        let config = DatabaseExtramuralConfig::create(
            tx,
            vault,
            wgfleet_shared::ExtramuralConfigContents {
                local_peer_id: peer_row.id,
                sponsor_id: sponsor_row.id,
                permanent_guid: String::new(),
                public_key,
                ipv4_addr,
                ipv6_addr,
                dns,
                mtu: doc.interface().get("MTU").and_then(|m| m.parse().ok()),
                listen_port: doc
                    .interface()
                    .get("ListenPort")
                    .and_then(|p| p.parse().ok()),
                interface_name: interface_name.clone(),
                pending_remote_update: false,
                last_deployed_at: None,
                last_key_rotation_at: None,
            },
            &private_key,
        )?;
        DatabaseHooks::replace(
            tx,
            HookOwner::ExtramuralConfig(config.id),
            &import::interface_hooks(doc.interface()),
        )?;
        DatabaseConfigDocument::put(tx, "extramural_config", config.id, &text)?;

        let mut peer_count = 0;
        for (index, peer) in doc.peers().enumerate() {
            let Some(public_key) = peer.get("PublicKey") else {
                continue;
            };
            let Some(endpoint) = peer.get("Endpoint").and_then(|e| e.parse().ok()) else {
                return Err(Error::validation(
                    "Endpoint",
                    "sponsor peers must carry an endpoint",
                ));
            };
            let allowed = peer
                .get("AllowedIPs")
                .unwrap_or_else(|| "0.0.0.0/0, ::/0".to_string());
            DatabaseExtramuralPeer::create(
                tx,
                vault,
                wgfleet_shared::ExtramuralPeerContents {
                    config_id: config.id,
                    name: format!("peer-{}", index + 1),
                    public_key,
                    endpoint,
                    allowed_ips: allowed,
                    has_psk: peer.get("PresharedKey").is_some(),
                    keepalive: peer
                        .get("PersistentKeepalive")
                        .and_then(|k| k.parse().ok()),
                    is_active: index == 0,
                },
                peer.get("PresharedKey").as_deref(),
            )?;
            peer_count += 1;
        }
        if peer_count == 0 {
            return Err(Error::validation(
                "peers",
                "sponsor config has no [Peer] sections",
            ));
        }

        let reference = format!("{local_peer}/{sponsor}");
        let audit = AuditEvent::new("extramural_imported", "extramural", &operator)
            .entity("extramural_config", config.id, &config.permanent_guid)
            .details(json!({ "config": reference, "peers": peer_count }));
        let event = Event::ExtramuralImported {
            config: reference.clone(),
            peers: peer_count,
        };
        Ok((
            ExtramuralImportSummary {
                config_id: config.id,
                reference,
                peers: peer_count,
            },
            audit,
            event,
        ))
    })
}

/// Summary of an extramural import.
#[derive(Clone, Debug)]
pub struct ExtramuralImportSummary {
    pub config_id: i64,
    pub reference: String,
    pub peers: usize,
}

pub fn confirm_remote_update(ctx: &Context, config_ref: &str) -> Result<(), Error> {
    let operator = ctx.operator();
    let config_ref = config_ref.to_string();
    mutate(ctx, move |tx, _vault| {
        let config = DatabaseExtramuralConfig::get_by_ref(tx, &config_ref)?;
        DatabaseExtramuralConfig::confirm_remote_update(tx, config.id)?;
        let audit = AuditEvent::new("remote_update_confirmed", "extramural", &operator)
            .entity("extramural_config", config.id, &config.permanent_guid)
            .details(json!({ "config": config_ref }));
        let event = Event::RemoteUpdateConfirmed {
            config: config_ref.clone(),
        };
        Ok(((), audit, event))
    })
}

/// Changes the vault passphrase, re-encrypting every secret column in one
/// transaction. Returns the new vault for the caller to swap into context.
pub fn change_passphrase(ctx: &Context, new_passphrase: &str) -> Result<Arc<Vault>, Error> {
    let operator = ctx.operator();
    let new_passphrase = new_passphrase.to_string();
    let old_vault = ctx.vault.clone();
    mutate(ctx, move |tx, _vault| {
        let new_vault = vault::change_passphrase(tx, &old_vault, &new_passphrase)?;
        let audit = AuditEvent::new("passphrase_changed", "crypto", &operator)
            .severity(Severity::Warning);
        Ok((Arc::new(new_vault), audit, Event::PassphraseChanged))
    })
}

/// Renders all configs to the output directory, recording the generation.
pub fn generate_all(
    ctx: &Context,
    out_dir: &std::path::Path,
) -> Result<Vec<(String, crate::generator::GeneratedConfig)>, Error> {
    use std::io::Write;

    let operator = ctx.operator();
    let configs = mutate(ctx, move |tx, vault| {
        let generator = crate::generator::Generator::new(tx, vault);
        let configs = generator.all_configs()?;
        let audit = AuditEvent::new("configs_generated", "generation", &operator)
            .details(json!({ "count": configs.len() }));
        let event = Event::ConfigsGenerated {
            count: configs.len(),
        };
        Ok((configs, audit, event))
    })?;

    std::fs::create_dir_all(out_dir)?;
    for (_, config) in &configs {
        let path = out_dir.join(&config.name);
        let mut file = std::fs::File::create(&path)?;
        wgfleet_shared::chmod(&file, 0o600)?;
        file.write_all(config.text.as_bytes())?;
    }
    Ok(configs)
}

/// One target's deployment result.
#[derive(Clone, Debug)]
pub struct DeployOutcome {
    pub label: String,
    pub path: std::path::PathBuf,
    pub changed: bool,
    pub backup_path: Option<String>,
    pub error: Option<String>,
}

/// Regenerates everything and pushes each deployable config to its host.
/// Deployment is fire-and-report: failures are journaled and returned, but
/// the datastore keeps the operator's intended state and the deploy stays
/// retryable.
pub fn deploy_fleet(
    ctx: &Context,
    opts: &wgfleet_shared::cli::DeployOpts,
) -> Result<Vec<DeployOutcome>, Error> {
    use crate::deploy::{self, DeployOptions, DeployTarget};

    let configs = generate_all(ctx, &ctx.store.output_dir())?;
    let options = DeployOptions {
        restart: opts.restart,
        verify: opts.restart,
        dry_run: opts.dry_run,
    };

    let guard = ctx.db.lock();
    let mut targets = Vec::new();
    for (label, config) in &configs {
        if let Some(wanted) = &opts.target {
            if wanted != label && label.split('/').next_back() != Some(wanted.as_str()) {
                continue;
            }
        }
        // Remote (client) configs are not deployable; their devices pull
        // them via `qr` or `generate`.
        if label.starts_with("remote/") {
            continue;
        }
        let ssh_host_id = match label.as_str() {
            "hub" => DatabaseServer::get(&guard)?.ssh_host_id,
            other => match other.split_once('/') {
                Some(("router", name)) => DatabaseRouter::get_by_name(&guard, name)?.ssh_host_id,
                Some(("exit", name)) => DatabaseExit::get_by_name(&guard, name)?.ssh_host_id,
                Some(("extramural", interface_name)) => {
                    // Extramural deploys go through the owning local peer.
                    let config = DatabaseExtramuralConfig::list(&guard)?
                        .into_iter()
                        .find(|c| c.interface_name == interface_name);
                    match config {
                        Some(config) => DatabaseLocalPeer::list(&guard)?
                            .iter()
                            .find(|l| l.id == config.local_peer_id)
                            .and_then(|l| l.ssh_host_id),
                        None => None,
                    }
                },
                _ => None,
            },
        };
        let ssh = ssh_host_id
            .map(|id| DatabaseSshHost::get(&guard, id).map(|h| h.inner))
            .transpose()?;
        let config_dir = ssh
            .as_ref()
            .map(|h| h.config_dir.clone())
            .unwrap_or_else(|| std::path::PathBuf::from("/etc/wireguard"));
        let interface = config.name.trim_end_matches(".conf").to_string();
        targets.push((
            DeployTarget {
                label: label.clone(),
                ssh,
                path: config_dir.join(&config.name),
                interface,
            },
            config.clone(),
        ));
    }
    drop(guard);

    let mut outcomes = Vec::new();
    for (target, config) in targets {
        match deploy::deploy(&target, &config.text, &config.public_key, options) {
            Ok(report) => {
                if !opts.dry_run {
                    record_deployment(ctx, &target.label, true, None)?;
                }
                outcomes.push(DeployOutcome {
                    label: target.label,
                    path: target.path,
                    changed: report.changed,
                    backup_path: report.backup_path,
                    error: None,
                });
            },
            Err(e) => {
                let message = e.to_string();
                record_deployment(ctx, &target.label, false, Some(&message))?;
                outcomes.push(DeployOutcome {
                    label: target.label,
                    path: target.path,
                    changed: false,
                    backup_path: None,
                    error: Some(message),
                });
            },
        }
    }
    Ok(outcomes)
}

/// Records a deployment outcome (the deployer itself does no bookkeeping).
pub fn record_deployment(
    ctx: &Context,
    target: &str,
    success: bool,
    error: Option<&str>,
) -> Result<(), Error> {
    let operator = ctx.operator();
    let target = target.to_string();
    let error = error.map(str::to_string);
    mutate(ctx, move |_tx, _vault| {
        let severity = if success {
            Severity::Info
        } else {
            Severity::Warning
        };
        let audit = AuditEvent::new("deployed", "deployment", &operator)
            .severity(severity)
            .details(json!({ "target": target, "success": success, "error": error }));
        let event = Event::Deployed {
            target: target.clone(),
            success,
            error: error.clone(),
        };
        Ok(((), audit, event))
    })
}
