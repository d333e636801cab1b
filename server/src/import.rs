//! Importing an existing fleet from a directory of `.conf` files.
//!
//! The hub file is the one with the most `[Peer]` sections. Its peers are
//! classified by shape: LAN prefixes in AllowedIPs make a subnet router, an
//! endpoint with host-only AllowedIPs makes an exit node, anything else is
//! a remote (provisional until its client file shows up in the same
//! import). Observed peer order is persisted exactly, and every parsed file
//! is stored as that entity's document so later generations reproduce its
//! bytes.

use std::{collections::HashMap, fs, path::Path};

use ipnet::IpNet;
use rusqlite::Connection;
use wgfleet_conf::{ConfDocument, Key, Section};
use wgfleet_shared::{
    hooks::{HookCommand, HookDirection},
    AccessLevel, Endpoint, ExitContents, Hostname, PeerRole, RemoteContents, RouterContents,
    ServerContents,
};

use crate::{
    db::{
        DatabaseConfigDocument, DatabaseExit, DatabaseHooks, DatabasePeerOrder, DatabaseRemote,
        DatabaseRouter, DatabaseServer, HookOwner,
    },
    vault::Vault,
    Error,
};

#[derive(Clone, Debug, Default)]
pub struct ImportSummary {
    pub hub: String,
    pub routers: usize,
    pub remotes: usize,
    pub exits: usize,
    pub client_configs_matched: usize,
}

struct ParsedFile {
    stem: String,
    text: String,
    doc: ConfDocument,
}

/// What one hub `[Peer]` section looks like, before classification.
struct PeerShape {
    public_key: String,
    psk: Option<String>,
    endpoint: Option<Endpoint>,
    allowed: Vec<IpNet>,
    allowed_raw: String,
    name_hint: Option<String>,
}

pub fn import_directory(
    conn: &Connection,
    vault: &Vault,
    dir: &Path,
    hub_endpoint: Option<Endpoint>,
    hub_hostname: Option<String>,
    strict: bool,
) -> Result<ImportSummary, Error> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("conf") {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        let doc = if strict {
            wgfleet_conf::parse_strict(&text)?
        } else {
            wgfleet_conf::parse(&text)?
        };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("imported")
            .to_string();
        files.push(ParsedFile { stem, text, doc });
    }
    if files.is_empty() {
        return Err(Error::validation(
            "import",
            format!("no .conf files found in {}", dir.display()),
        ));
    }

    // The hub is the file with the most peers; everything else is a client
    // config to be matched by key.
    let hub_idx = files
        .iter()
        .enumerate()
        .max_by_key(|(_, f)| f.doc.peers().count())
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    let hub_file = files.swap_remove(hub_idx);

    let private_key_text = hub_file
        .doc
        .interface()
        .get("PrivateKey")
        .ok_or_else(|| Error::validation("PrivateKey", "hub config has no PrivateKey"))?;
    let private_key = Key::from_base64(&private_key_text)?;
    let public_key = private_key.get_public().to_base64();

    let listen_port: u16 = hub_file
        .doc
        .interface()
        .get("ListenPort")
        .and_then(|p| p.parse().ok())
        .unwrap_or(51820);

    let mut ipv4_cidr = None;
    let mut ipv6_cidr = None;
    let mut ipv4_addr = None;
    let mut ipv6_addr = None;
    if let Some(field) = hub_file.doc.interface().field("Address") {
        for item in field.value.items() {
            match item.parse::<IpNet>() {
                Ok(IpNet::V4(net)) => {
                    ipv4_addr = Some(net.addr());
                    ipv4_cidr = net.trunc().into();
                },
                Ok(IpNet::V6(net)) => {
                    ipv6_addr = Some(net.addr());
                    ipv6_cidr = net.trunc().into();
                },
                Err(_) => match item.parse() {
                    Ok(std::net::IpAddr::V4(a)) => ipv4_addr = Some(a),
                    Ok(std::net::IpAddr::V6(a)) => ipv6_addr = Some(a),
                    Err(_) => {
                        return Err(Error::validation(
                            "Address",
                            format!("unparseable hub address {item}"),
                        ))
                    },
                },
            }
        }
    }

    let shapes: Vec<PeerShape> = hub_file
        .doc
        .peers()
        .map(peer_shape)
        .collect::<Result<_, _>>()?;

    // The hub's public endpoint is not in its own file; a client config
    // pointing back at the hub key carries it.
    let endpoint = match hub_endpoint {
        Some(endpoint) => endpoint,
        None => files
            .iter()
            .flat_map(|f| f.doc.peers())
            .filter(|p| p.get("PublicKey").as_deref() == Some(public_key.as_str()))
            .find_map(|p| p.get("Endpoint").and_then(|e| e.parse().ok()))
            .ok_or_else(|| {
                Error::validation(
                    "endpoint",
                    "hub endpoint not derivable from any client config; pass --endpoint",
                )
            })?,
    };

    let hostname: Hostname = hub_hostname
        .unwrap_or_else(|| hub_file.stem.clone())
        .parse()
        .map_err(|e: &str| Error::validation("hostname", e))?;

    let mtu = hub_file
        .doc
        .interface()
        .get("MTU")
        .and_then(|m| m.parse().ok());

    let server = DatabaseServer::create(
        conn,
        vault,
        ServerContents {
            hostname,
            endpoint,
            ipv4_cidr,
            ipv6_cidr,
            ipv4_addr,
            ipv6_addr,
            public_key: public_key.clone(),
            permanent_guid: String::new(),
            listen_port,
            mtu,
            ssh_host_id: None,
        },
        &private_key_text,
    )?;
    DatabaseHooks::replace(
        conn,
        HookOwner::Server(server.id),
        &interface_hooks(hub_file.doc.interface()),
    )?;
    DatabaseConfigDocument::put(conn, "server", server.id, &hub_file.text)?;

    let mut summary = ImportSummary {
        hub: (*server.hostname).clone(),
        ..Default::default()
    };
    let mut order: Vec<(PeerRole, i64)> = Vec::new();
    let mut used_names: Vec<String> = vec![(*server.hostname).clone()];
    let mut key_to_peer: HashMap<String, (PeerRole, i64)> = HashMap::new();

    for (index, shape) in shapes.iter().enumerate() {
        let hub_cidrs = server.vpn_cidrs();
        let host_addrs: Vec<IpNet> = shape
            .allowed
            .iter()
            .filter(|net| is_host_route(net) && hub_cidrs.iter().any(|c| c.contains(&net.addr())))
            .cloned()
            .collect();
        let lans: Vec<IpNet> = shape
            .allowed
            .iter()
            .filter(|net| !is_host_route(net))
            .cloned()
            .collect();
        let ipv4 = host_addrs.iter().find_map(|n| match n.addr() {
            std::net::IpAddr::V4(a) => Some(a),
            _ => None,
        });
        let ipv6 = host_addrs.iter().find_map(|n| match n.addr() {
            std::net::IpAddr::V6(a) => Some(a),
            _ => None,
        });
        let name = unique_name(
            shape.name_hint.clone(),
            &mut used_names,
            index,
            if !lans.is_empty() {
                "router"
            } else if shape.endpoint.is_some() {
                "exit"
            } else {
                "peer"
            },
        );

        if !lans.is_empty() {
            let router = DatabaseRouter::create(
                conn,
                vault,
                RouterContents {
                    server_id: server.id,
                    hostname: name,
                    ipv4_addr: ipv4,
                    ipv6_addr: ipv6,
                    endpoint: shape.endpoint.clone(),
                    has_endpoint: shape.endpoint.is_some(),
                    lans,
                    allowed_ips: shape.allowed_raw.clone(),
                    public_key: shape.public_key.clone(),
                    permanent_guid: String::new(),
                    ssh_host_id: None,
                },
                None,
            )?;
            key_to_peer.insert(shape.public_key.clone(), (PeerRole::Router, router.id));
            order.push((PeerRole::Router, router.id));
            summary.routers += 1;
        } else if let Some(endpoint) = &shape.endpoint {
            let exit = DatabaseExit::create(
                conn,
                vault,
                ExitContents {
                    server_id: server.id,
                    hostname: name,
                    endpoint: endpoint.clone(),
                    listen_port: endpoint.port(),
                    ipv4_addr: ipv4,
                    ipv6_addr: ipv6,
                    public_key: shape.public_key.clone(),
                    permanent_guid: String::new(),
                    ssh_host_id: None,
                },
                None,
            )?;
            key_to_peer.insert(shape.public_key.clone(), (PeerRole::Exit, exit.id));
            order.push((PeerRole::Exit, exit.id));
            summary.exits += 1;
        } else {
            let remote = DatabaseRemote::create(
                conn,
                vault,
                RemoteContents {
                    server_id: server.id,
                    hostname: name,
                    ipv4_addr: ipv4,
                    ipv6_addr: ipv6,
                    public_key: shape.public_key.clone(),
                    permanent_guid: String::new(),
                    access_level: AccessLevel::VpnOnly,
                    lan_access: Vec::new(),
                    custom_allowed_ips: None,
                    exit_node_id: None,
                    exit_group_id: None,
                    active_exit_id: None,
                    has_psk: shape.psk.is_some(),
                    keepalive: None,
                    last_rotated_at: None,
                },
                None,
                shape.psk.as_deref(),
            )?;
            key_to_peer.insert(shape.public_key.clone(), (PeerRole::Remote, remote.id));
            order.push((PeerRole::Remote, remote.id));
            summary.remotes += 1;
        }
    }
    // Creation appended category-sorted entries; replace with the observed
    // file order, which wins on import.
    DatabasePeerOrder::set(conn, server.id, &order)?;

    // Match the remaining files to peers by derived public key.
    for file in &files {
        let Some(private) = file.doc.interface().get("PrivateKey") else {
            continue;
        };
        let Ok(key) = Key::from_base64(&private) else {
            log::warn!("{}.conf: unparseable PrivateKey, skipping", file.stem);
            continue;
        };
        let derived = key.get_public().to_base64();
        match key_to_peer.get(&derived) {
            Some((PeerRole::Remote, id)) => {
                conn.execute(
                    "UPDATE remotes SET private_key = ?1 WHERE id = ?2",
                    rusqlite::params![vault.seal(&private)?, id],
                )?;
                let access = infer_access_level(file, &server.vpn_cidrs());
                conn.execute(
                    "UPDATE remotes SET access_level = ?1, custom_allowed_ips = ?2 WHERE id = ?3",
                    rusqlite::params![access.0.as_str(), access.1, id],
                )?;
                DatabaseConfigDocument::put(conn, "remote", *id, &file.text)?;
                summary.client_configs_matched += 1;
            },
            Some((PeerRole::Router, id)) => {
                conn.execute(
                    "UPDATE routers SET private_key = ?1 WHERE id = ?2",
                    rusqlite::params![vault.seal(&private)?, id],
                )?;
                DatabaseHooks::replace(
                    conn,
                    HookOwner::Router(*id),
                    &interface_hooks(file.doc.interface()),
                )?;
                DatabaseConfigDocument::put(conn, "router", *id, &file.text)?;
                summary.client_configs_matched += 1;
            },
            Some((PeerRole::Exit, id)) => {
                conn.execute(
                    "UPDATE exits SET private_key = ?1 WHERE id = ?2",
                    rusqlite::params![vault.seal(&private)?, id],
                )?;
                DatabaseHooks::replace(
                    conn,
                    HookOwner::Exit(*id),
                    &interface_hooks(file.doc.interface()),
                )?;
                DatabaseConfigDocument::put(conn, "exit", *id, &file.text)?;
                summary.client_configs_matched += 1;
            },
            None => {
                log::warn!(
                    "{}.conf does not match any peer of the imported hub, skipping",
                    file.stem
                );
            },
        }
    }

    Ok(summary)
}

fn is_host_route(net: &IpNet) -> bool {
    matches!(net, IpNet::V4(n) if n.prefix_len() == 32)
        || matches!(net, IpNet::V6(n) if n.prefix_len() == 128)
}

fn peer_shape(section: &Section) -> Result<PeerShape, Error> {
    let public_key = section
        .get("PublicKey")
        .ok_or_else(|| Error::validation("PublicKey", "peer section without PublicKey"))?;
    Key::from_base64(&public_key)?;

    let allowed_raw = section.get("AllowedIPs").unwrap_or_default();
    let allowed: Vec<IpNet> = section
        .field("AllowedIPs")
        .map(|f| {
            f.value
                .items()
                .iter()
                .filter_map(|i| i.parse().ok())
                .collect()
        })
        .unwrap_or_default();
    let endpoint = section.get("Endpoint").and_then(|e| e.parse().ok());
    let psk = section.get("PresharedKey");

    // A "# name" or "# Name = x" comment right above the peer names it.
    let name_hint = section.leading.iter().rev().find_map(|item| match item {
        wgfleet_conf::Item::Comment { text, .. } => {
            let body = text.trim_start_matches('#').trim();
            let body = body.strip_prefix("Name =").map(str::trim).unwrap_or(body);
            body.to_lowercase().parse::<Hostname>().ok().map(|h| (*h).clone())
        },
        _ => None,
    });

    Ok(PeerShape {
        public_key,
        psk,
        endpoint,
        allowed,
        allowed_raw,
        name_hint,
    })
}

fn unique_name(
    hint: Option<String>,
    used: &mut Vec<String>,
    index: usize,
    kind: &str,
) -> Hostname {
    let base = hint.unwrap_or_else(|| format!("{kind}-{}", index + 1));
    let mut candidate = base.clone();
    let mut n = 1;
    while used.contains(&candidate) {
        n += 1;
        candidate = format!("{base}-{n}");
    }
    used.push(candidate.clone());
    candidate
        .parse()
        .unwrap_or_else(|_| format!("{kind}-{}", index + 1).parse().expect("generated names are valid"))
}

pub(crate) fn interface_hooks(section: &Section) -> Vec<HookCommand> {
    let mut hooks = Vec::new();
    let mut seq = 0;
    for direction in [
        HookDirection::PreUp,
        HookDirection::PostUp,
        HookDirection::PreDown,
        HookDirection::PostDown,
    ] {
        for text in section.get_all(direction.as_str()) {
            hooks.push(HookCommand::verbatim(direction, seq, &text));
            seq += 1;
        }
    }
    hooks
}

/// Guesses a remote's access level from its own config: hub CIDRs only is
/// vpn_only, anything else is custom with the exact text preserved.
fn infer_access_level(
    file: &ParsedFile,
    hub_cidrs: &[IpNet],
) -> (AccessLevel, Option<String>) {
    let hub_texts: Vec<String> = hub_cidrs.iter().map(|c| c.to_string()).collect();
    for peer in file.doc.peers() {
        let Some(field) = peer.field("AllowedIPs") else {
            continue;
        };
        let items: Vec<String> = field.value.items().iter().map(|s| s.to_string()).collect();
        if items == hub_texts {
            return (AccessLevel::VpnOnly, None);
        }
        return (AccessLevel::Custom, Some(items.join(", ")));
    }
    (AccessLevel::VpnOnly, None)
}
