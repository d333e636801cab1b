//! Option structs for the wgfleet CLI, flattened into the binary's
//! subcommands. These stay in the shared crate so external collaborators
//! (the TUI, scripts) can construct the same requests programmatically.

use std::{net::IpAddr, path::PathBuf};

use clap::Args;
use ipnet::IpNet;

use crate::types::{AccessLevel, SelectionStrategy};

#[derive(Clone, Debug, Default, Args)]
pub struct AddRemoteOpts {
    /// Name of the new remote, in hostname(7) form
    pub name: Option<String>,

    /// VPN address to assign; the next free address is allocated if omitted
    #[clap(long)]
    pub ip: Option<IpAddr>,

    /// Access level for the remote
    #[clap(long, default_value = "vpn_only")]
    pub access_level: AccessLevel,

    /// For lan_only: the LAN prefixes this remote may reach
    #[clap(long = "lan")]
    pub lans: Vec<IpNet>,

    /// For custom: the exact AllowedIPs text to emit
    #[clap(long)]
    pub allowed_ips: Option<String>,

    /// Attach the remote to this exit node
    #[clap(long)]
    pub exit: Option<String>,

    /// Attach the remote to this exit group
    #[clap(long)]
    pub exit_group: Option<String>,

    /// Also generate a preshared key for the hub<->remote pair
    #[clap(long)]
    pub psk: bool,

    /// The remote's public key, for peers whose private key never leaves
    /// their own device
    #[clap(long)]
    pub public_key: Option<String>,
}

#[derive(Clone, Debug, Default, Args)]
pub struct AddRouterOpts {
    /// Name of the new subnet router
    pub name: Option<String>,

    /// VPN address to assign; allocated if omitted
    #[clap(long)]
    pub ip: Option<IpAddr>,

    /// Public endpoint (host:port); omit for routers behind CGNAT
    #[clap(long)]
    pub endpoint: Option<String>,

    /// LAN prefixes the router advertises into the VPN, in order
    #[clap(long = "lan")]
    pub lans: Vec<IpNet>,

    /// SSH host (by name) used to deploy this router's config
    #[clap(long)]
    pub ssh_host: Option<String>,
}

#[derive(Clone, Debug, Default, Args)]
pub struct AddExitOpts {
    /// Name of the new exit node
    pub name: Option<String>,

    /// Public endpoint (host:port)
    #[clap(long)]
    pub endpoint: Option<String>,

    /// WireGuard listen port on the exit
    #[clap(long, default_value = "51820")]
    pub listen_port: u16,

    /// VPN address to assign; allocated if omitted
    #[clap(long)]
    pub ip: Option<IpAddr>,

    /// WAN interface on the exit used for the generated NAT hooks
    #[clap(long, default_value = "eth0")]
    pub wan_interface: String,

    /// Add the exit to this group
    #[clap(long)]
    pub group: Option<String>,
}

#[derive(Clone, Debug, Default, Args)]
pub struct AddExitGroupOpts {
    /// Name of the new exit group
    pub name: Option<String>,

    #[clap(long, default_value = "priority")]
    pub strategy: SelectionStrategy,

    /// Seconds between health checks
    #[clap(long, default_value = "30")]
    pub check_interval: u32,

    /// Seconds before a probe counts as failed
    #[clap(long, default_value = "5")]
    pub check_timeout: u32,
}

#[derive(Clone, Debug, Default, Args)]
pub struct AddSshHostOpts {
    /// Unique name for the SSH host
    pub name: Option<String>,

    #[clap(long)]
    pub host: Option<String>,

    #[clap(long, default_value = "22")]
    pub port: u16,

    #[clap(long, default_value = "root")]
    pub user: String,

    /// Private key file; the SSH agent is used when omitted
    #[clap(long)]
    pub key_path: Option<PathBuf>,

    /// Directory on the host where configs are placed
    #[clap(long, default_value = "/etc/wireguard")]
    pub config_dir: PathBuf,
}

#[derive(Clone, Debug, Default, Args)]
pub struct AddSponsorOpts {
    /// Unique sponsor name
    pub name: Option<String>,

    #[clap(long)]
    pub website: Option<String>,
}

#[derive(Clone, Debug, Default, Args)]
pub struct AddLocalPeerOpts {
    /// Unique local peer name
    pub name: Option<String>,

    /// SSH host (by name) used to deploy this peer's extramural configs
    #[clap(long)]
    pub ssh_host: Option<String>,
}

#[derive(Clone, Debug, Default, Args)]
pub struct RemoveOpts {
    /// Entity kind: remote, router, exit, exit-group, sponsor, local-peer
    /// or ssh-host
    pub kind: String,

    /// Entity name
    pub name: String,

    /// Bypass confirmation
    #[clap(long)]
    pub yes: bool,
}

#[derive(Clone, Debug, Default, Args)]
pub struct RotateOpts {
    /// Entity to rotate, e.g. `remote/carol` or `router/office`; the hub's
    /// own key pair when omitted
    pub entity: Option<String>,

    /// Reason recorded in the rotation history
    #[clap(long, default_value = "scheduled")]
    pub reason: String,
}

#[derive(Clone, Debug, Default, Args)]
pub struct GenerateOpts {
    /// Output directory; defaults to `<datastore>/output`
    #[clap(long)]
    pub out: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Args)]
pub struct DeployOpts {
    /// Target to deploy, e.g. `hub`, `router/office`, `extramural/laptop/mullvad`;
    /// all deployable targets when omitted
    pub target: Option<String>,

    /// Restart the interface after placing the config
    #[clap(long)]
    pub restart: bool,

    /// Print what would happen without touching any host
    #[clap(long)]
    pub dry_run: bool,
}

#[derive(Clone, Debug, Default, Args)]
pub struct StatusOpts {
    /// Keep refreshing until interrupted
    #[clap(long)]
    pub live: bool,
}

#[derive(Clone, Debug, Default, Args)]
pub struct ImportOpts {
    /// Directory of .conf files to import; defaults to `<datastore>/import`
    pub dir: Option<PathBuf>,

    /// Public endpoint of the hub (host:port); inferred from a client
    /// config when omitted
    #[clap(long)]
    pub endpoint: Option<String>,

    /// Hostname for the hub; defaults to the hub file's stem
    #[clap(long)]
    pub hostname: Option<String>,

    /// Reject unknown fields instead of preserving them
    #[clap(long)]
    pub strict: bool,
}

#[derive(Clone, Debug, Default, Args)]
pub struct PskOpts {
    /// The remote to (re)generate a preshared key for
    pub peer: String,

    /// Remove the preshared key instead
    #[clap(long)]
    pub remove: bool,
}

#[derive(Clone, Debug, Default, Args)]
pub struct ExtramuralImportOpts {
    /// Local peer name the config belongs to
    pub local_peer: String,

    /// Sponsor name
    pub sponsor: String,

    /// The sponsor-provided .conf file
    pub path: PathBuf,

    /// Interface name to manage, e.g. wg-mullvad
    #[clap(long)]
    pub interface: Option<String>,
}

#[derive(Clone, Debug, Default, Args)]
pub struct ExtramuralSwitchOpts {
    /// Config reference as `<local-peer>/<sponsor>`
    pub config: String,

    /// Name of the sponsor peer to activate
    pub peer: String,
}

#[derive(Clone, Debug, Default, Args)]
pub struct ExtramuralAddPeerOpts {
    /// Config reference as `<local-peer>/<sponsor>`
    pub config: String,

    /// Name for the new sponsor peer, e.g. us-west
    pub name: String,

    /// Sponsor-side public key
    #[clap(long)]
    pub public_key: String,

    /// Sponsor-side endpoint (host:port)
    #[clap(long)]
    pub endpoint: String,

    /// AllowedIPs for the peer; defaults to the default route
    #[clap(long, default_value = "0.0.0.0/0, ::/0")]
    pub allowed_ips: String,

    #[clap(long)]
    pub keepalive: Option<u16>,

    /// Activate the new peer immediately
    #[clap(long)]
    pub activate: bool,
}
