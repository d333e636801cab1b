use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    ops::{Deref, DerefMut},
    path::PathBuf,
    str::FromStr,
};
use url::Host;

/// Regex matching hostname(7) requirements; peers double as reachable
/// hostnames. Total length (max 63) is checked separately.
static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-z0-9]-?)*[a-z0-9]$").unwrap());

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hostname(String);

impl FromStr for Hostname {
    type Err = &'static str;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if name.len() < 64 && HOSTNAME_REGEX.is_match(name) {
            Ok(Self(name.to_string()))
        } else {
            Err("hostname must conform to hostname(7) requirements")
        }
    }
}

impl Deref for Hostname {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Hostname {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An external endpoint supporting IP and domain name hosts. IPv6 hosts
/// render bracketed (`[2001:db8::1]:51820`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl Endpoint {
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn resolve(&self) -> Result<SocketAddr, io::Error> {
        let mut addrs = self.to_string().to_socket_addrs()?;
        addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "failed to resolve address".to_string(),
            )
        })
    }

    /// Whether this endpoint points at the machine we are running on.
    pub fn is_local(&self, local_hostname: Option<&str>) -> bool {
        match &self.host {
            Host::Ipv4(ip) => ip.is_loopback(),
            Host::Ipv6(ip) => ip.is_loopback(),
            Host::Domain(domain) => {
                domain == "localhost" || Some(domain.as_str()) == local_hostname
            },
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self {
                host: Host::Ipv4(*v4.ip()),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self {
                host: Host::Ipv6(*v6.ip()),
                port: v6.port(),
            },
        }
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplitn(2, ':').collect::<Vec<&str>>().as_slice() {
            [port, host] => {
                let port = port.parse().map_err(|_| "couldn't parse port")?;
                let host = Host::parse(host).map_err(|_| "couldn't parse host")?;
                Ok(Endpoint { host, port })
            },
            _ => Err("couldn't parse in form of 'host:port'"),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)?;
        f.write_str(":")?;
        self.port.fmt(f)
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EndpointVisitor;
        impl serde::de::Visitor<'_> for EndpointVisitor {
            type Value = Endpoint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a valid host:port endpoint")
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                s.parse().map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(EndpointVisitor)
    }
}

/// Policy tag on a remote, driving what AllowedIPs its generated config
/// carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    FullAccess,
    #[default]
    VpnOnly,
    LanOnly,
    Custom,
    ExitOnly,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::FullAccess => "full_access",
            AccessLevel::VpnOnly => "vpn_only",
            AccessLevel::LanOnly => "lan_only",
            AccessLevel::Custom => "custom",
            AccessLevel::ExitOnly => "exit_only",
        }
    }
}

impl FromStr for AccessLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_access" => Ok(AccessLevel::FullAccess),
            "vpn_only" => Ok(AccessLevel::VpnOnly),
            "lan_only" => Ok(AccessLevel::LanOnly),
            "custom" => Ok(AccessLevel::Custom),
            "exit_only" => Ok(AccessLevel::ExitOnly),
            _ => Err("one of: full_access, vpn_only, lan_only, custom, exit_only"),
        }
    }
}

impl Display for AccessLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit-breaker state of an exit node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failed => "failed",
        }
    }
}

impl FromStr for HealthState {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthState::Healthy),
            "degraded" => Ok(HealthState::Degraded),
            "failed" => Ok(HealthState::Failed),
            _ => Err("one of: healthy, degraded, failed"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    Priority,
    RoundRobin,
    Latency,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Priority => "priority",
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::Latency => "latency",
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(SelectionStrategy::Priority),
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            "latency" => Ok(SelectionStrategy::Latency),
            _ => Err("one of: priority, round_robin, latency"),
        }
    }
}

/// Which table a hub peer-ordering row points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Router,
    Remote,
    Exit,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Router => "router",
            PeerRole::Remote => "remote",
            PeerRole::Exit => "exit",
        }
    }
}

impl FromStr for PeerRole {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "router" => Ok(PeerRole::Router),
            "remote" => Ok(PeerRole::Remote),
            "exit" => Ok(PeerRole::Exit),
            _ => Err("one of: router, remote, exit"),
        }
    }
}

/// One row of a hub's total peer order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerOrderEntry {
    pub seq: i64,
    pub role: PeerRole,
    pub peer_id: i64,
}

/// The coordination server: the public hub every mesh peer talks to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContents {
    pub hostname: Hostname,
    pub endpoint: Endpoint,
    pub ipv4_cidr: Option<Ipv4Net>,
    pub ipv6_cidr: Option<Ipv6Net>,
    pub ipv4_addr: Option<Ipv4Addr>,
    pub ipv6_addr: Option<Ipv6Addr>,
    pub public_key: String,
    pub permanent_guid: String,
    pub listen_port: u16,
    pub mtu: Option<u16>,
    pub ssh_host_id: Option<i64>,
}

impl ServerContents {
    /// VPN addresses as /32 + /128 nets, v4 first.
    pub fn addresses(&self) -> Vec<IpNet> {
        let mut addrs = Vec::new();
        if let Some(v4) = self.ipv4_addr {
            addrs.push(IpNet::new(IpAddr::V4(v4), 32).unwrap());
        }
        if let Some(v6) = self.ipv6_addr {
            addrs.push(IpNet::new(IpAddr::V6(v6), 128).unwrap());
        }
        addrs
    }

    /// The VPN network ranges, v4 first.
    pub fn vpn_cidrs(&self) -> Vec<IpNet> {
        let mut cidrs = Vec::new();
        if let Some(v4) = self.ipv4_cidr {
            cidrs.push(IpNet::V4(v4));
        }
        if let Some(v6) = self.ipv6_cidr {
            cidrs.push(IpNet::V6(v6));
        }
        cidrs
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,

    #[serde(flatten)]
    pub contents: ServerContents,
}

impl Deref for Server {
    type Target = ServerContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Server {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

/// A subnet router: a peer advertising LAN prefixes into the VPN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterContents {
    pub server_id: i64,
    pub hostname: Hostname,
    pub ipv4_addr: Option<Ipv4Addr>,
    pub ipv6_addr: Option<Ipv6Addr>,
    /// `None` means the router sits behind CGNAT and the hub must not write
    /// an `Endpoint` line for it.
    pub endpoint: Option<Endpoint>,
    pub has_endpoint: bool,
    /// LAN prefixes advertised into the VPN, in operator order.
    pub lans: Vec<IpNet>,
    /// The exact AllowedIPs text written into the hub's peer block.
    pub allowed_ips: String,
    pub public_key: String,
    pub permanent_guid: String,
    pub ssh_host_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: i64,

    #[serde(flatten)]
    pub contents: RouterContents,
}

impl Deref for Router {
    type Target = RouterContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Router {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

/// A client peer: laptop, phone, server that consumes the VPN.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteContents {
    pub server_id: i64,
    pub hostname: Hostname,
    pub ipv4_addr: Option<Ipv4Addr>,
    pub ipv6_addr: Option<Ipv6Addr>,
    pub public_key: String,
    pub permanent_guid: String,
    pub access_level: AccessLevel,
    /// For `lan_only`: the subset of advertised LANs this remote may reach.
    pub lan_access: Vec<IpNet>,
    /// For `custom`: the operator-supplied exact AllowedIPs.
    pub custom_allowed_ips: Option<String>,
    pub exit_node_id: Option<i64>,
    pub exit_group_id: Option<i64>,
    /// The exit currently serving this remote (may differ from the static
    /// assignment after failover). `None` means "no exit".
    pub active_exit_id: Option<i64>,
    pub has_psk: bool,
    pub keepalive: Option<u16>,
    pub last_rotated_at: Option<DateTime<Utc>>,
}

impl RemoteContents {
    pub fn addresses(&self) -> Vec<IpNet> {
        let mut addrs = Vec::new();
        if let Some(v4) = self.ipv4_addr {
            addrs.push(IpNet::new(IpAddr::V4(v4), 32).unwrap());
        }
        if let Some(v6) = self.ipv6_addr {
            addrs.push(IpNet::new(IpAddr::V6(v6), 128).unwrap());
        }
        addrs
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub id: i64,

    #[serde(flatten)]
    pub contents: RemoteContents,
}

impl Deref for Remote {
    type Target = RemoteContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Remote {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

/// An exit node: NATs remote traffic to the Internet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitContents {
    pub server_id: i64,
    pub hostname: Hostname,
    pub endpoint: Endpoint,
    pub listen_port: u16,
    pub ipv4_addr: Option<Ipv4Addr>,
    pub ipv6_addr: Option<Ipv6Addr>,
    pub public_key: String,
    pub permanent_guid: String,
    pub ssh_host_id: Option<i64>,
}

impl ExitContents {
    pub fn addresses(&self) -> Vec<IpNet> {
        let mut addrs = Vec::new();
        if let Some(v4) = self.ipv4_addr {
            addrs.push(IpNet::new(IpAddr::V4(v4), 32).unwrap());
        }
        if let Some(v6) = self.ipv6_addr {
            addrs.push(IpNet::new(IpAddr::V6(v6), 128).unwrap());
        }
        addrs
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    pub id: i64,

    #[serde(flatten)]
    pub contents: ExitContents,
}

impl Deref for Exit {
    type Target = ExitContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Exit {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

/// A named set of exit nodes with a selection strategy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitGroupContents {
    pub name: String,
    pub strategy: SelectionStrategy,
    pub check_interval_secs: u32,
    pub check_timeout_secs: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitGroup {
    pub id: i64,

    #[serde(flatten)]
    pub contents: ExitGroupContents,
}

impl Deref for ExitGroup {
    type Target = ExitGroupContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitGroupMember {
    pub exit_id: i64,
    pub seq: i64,
    pub static_priority: i64,
    pub priority_adjustment: i64,
    pub weight: u32,
    pub enabled: bool,
}

/// Successful probe latencies kept per exit for the `latency` selection
/// strategy.
pub const LATENCY_WINDOW: usize = 5;

/// Health row for one exit node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitHealth {
    pub exit_id: i64,
    pub state: HealthState,
    pub last_check_at: Option<DateTime<Utc>>,
    /// Latency of the most recent successful probe.
    pub latency_ms: Option<u32>,
    /// Rolling window of recent successful probe latencies, oldest first,
    /// capped at [`LATENCY_WINDOW`].
    pub latency_samples: Vec<u32>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl ExitHealth {
    pub fn new(exit_id: i64) -> Self {
        ExitHealth {
            exit_id,
            state: HealthState::Healthy,
            last_check_at: None,
            latency_ms: None,
            latency_samples: Vec::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success_at: None,
            last_failure_at: None,
            failure_reason: None,
        }
    }

    /// Appends a successful probe's latency, dropping the oldest sample
    /// once the window is full.
    pub fn record_latency(&mut self, ms: u32) {
        self.latency_samples.push(ms);
        if self.latency_samples.len() > LATENCY_WINDOW {
            self.latency_samples.remove(0);
        }
    }

    /// Lower median of the rolling window; `None` until a probe succeeds.
    pub fn median_latency(&self) -> Option<u32> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let mut sorted = self.latency_samples.clone();
        sorted.sort_unstable();
        Some(sorted[(sorted.len() - 1) / 2])
    }
}

/// Append-only record of one failover decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverRecord {
    pub id: i64,
    pub remote_id: i64,
    pub group_id: i64,
    pub from_exit_id: Option<i64>,
    pub to_exit_id: Option<i64>,
    pub trigger_reason: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A shared SSH deployment target. Referenced by hubs, routers and
/// extramural local peers; never cascade-deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshHostContents {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub config_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshHost {
    pub id: i64,

    #[serde(flatten)]
    pub contents: SshHostContents,
}

impl Deref for SshHost {
    type Target = SshHostContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

/// An external WireGuard provider (commercial VPN, employer VPN).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sponsor {
    pub id: i64,
    pub name: String,
    pub website: Option<String>,
}

/// A machine of ours that holds extramural configs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPeer {
    pub id: i64,
    pub name: String,
    pub permanent_guid: Option<String>,
    pub ssh_host_id: Option<i64>,
}

/// Our side of an external WireGuard service; the remote side is opaque.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtramuralConfigContents {
    pub local_peer_id: i64,
    pub sponsor_id: i64,
    pub permanent_guid: String,
    pub public_key: String,
    pub ipv4_addr: Option<Ipv4Addr>,
    pub ipv6_addr: Option<Ipv6Addr>,
    pub dns: Vec<IpAddr>,
    pub mtu: Option<u16>,
    pub listen_port: Option<u16>,
    /// e.g. `wg-mullvad`
    pub interface_name: String,
    /// Set after a local key rotation until the operator confirms the
    /// sponsor has been told about the new key.
    pub pending_remote_update: bool,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub last_key_rotation_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtramuralConfig {
    pub id: i64,

    #[serde(flatten)]
    pub contents: ExtramuralConfigContents,
}

impl Deref for ExtramuralConfig {
    type Target = ExtramuralConfigContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for ExtramuralConfig {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

/// One sponsor-side peer of an extramural config. Exactly one per config is
/// active at a time (database-enforced).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtramuralPeerContents {
    pub config_id: i64,
    pub name: String,
    pub public_key: String,
    pub endpoint: Endpoint,
    pub allowed_ips: String,
    pub has_psk: bool,
    pub keepalive: Option<u16>,
    pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtramuralPeer {
    pub id: i64,

    #[serde(flatten)]
    pub contents: ExtramuralPeerContents,
}

impl Deref for ExtramuralPeer {
    type Target = ExtramuralPeerContents;

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostnames_follow_hostname7() {
        assert!("alice".parse::<Hostname>().is_ok());
        assert!("office-router-2".parse::<Hostname>().is_ok());
        assert!("Bad_Name".parse::<Hostname>().is_err());
        assert!("-leading".parse::<Hostname>().is_err());
        assert!("a".repeat(64).parse::<Hostname>().is_err());
    }

    #[test]
    fn endpoint_forms() {
        let e: Endpoint = "hub.example.com:51820".parse().unwrap();
        assert_eq!(e.to_string(), "hub.example.com:51820");

        let e: Endpoint = "203.0.113.4:51820".parse().unwrap();
        assert_eq!(e.port(), 51820);

        let e: Endpoint = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(e.to_string(), "[2001:db8::1]:51820");

        assert!("no-port".parse::<Endpoint>().is_err());
    }

    #[test]
    fn local_endpoints_detected() {
        let lo: Endpoint = "127.0.0.1:51820".parse().unwrap();
        assert!(lo.is_local(None));
        let named: Endpoint = "hub-box:51820".parse().unwrap();
        assert!(named.is_local(Some("hub-box")));
        assert!(!named.is_local(Some("elsewhere")));
    }

    #[test]
    fn dual_stack_addresses_render_v4_first() {
        let contents = ServerContents {
            hostname: "hub".parse().unwrap(),
            endpoint: "hub.example.com:51820".parse().unwrap(),
            ipv4_cidr: Some("10.66.0.0/24".parse().unwrap()),
            ipv6_cidr: Some("fd66::/64".parse().unwrap()),
            ipv4_addr: Some("10.66.0.1".parse().unwrap()),
            ipv6_addr: Some("fd66::1".parse().unwrap()),
            public_key: String::new(),
            permanent_guid: String::new(),
            listen_port: 51820,
            mtu: None,
            ssh_host_id: None,
        };
        let addrs: Vec<String> = contents.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.66.0.1/32", "fd66::1/128"]);
    }
}
