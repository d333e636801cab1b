//! The access policy engine: pure computation of which peer entries a
//! remote's config carries and what `AllowedIPs` each one gets. No I/O
//! happens here; the generator feeds it topology context and renders
//! whatever comes back.

use ipnet::IpNet;
use wgfleet_shared::AccessLevel;

use crate::Error;

/// One outgoing `[Peer]` entry of a remote's config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemotePeerEntry {
    /// The coordination server.
    Hub { allowed_ips: Vec<String> },
    /// The remote's active exit node, routing everything.
    Exit {
        exit_id: i64,
        allowed_ips: Vec<String>,
    },
}

/// Default route in both families.
fn default_route() -> Vec<String> {
    vec!["0.0.0.0/0".to_string(), "::/0".to_string()]
}

/// Joins hub CIDRs with extra prefixes: exact duplicates dropped, then
/// ordered by ascending prefix length so broad routes come first and the
/// smallest (most specific) prefixes render last. Equal prefix lengths
/// keep their arrival order.
fn merge(hub_cidrs: &[IpNet], extra: &[IpNet]) -> Vec<String> {
    let mut nets: Vec<IpNet> = Vec::new();
    for net in hub_cidrs.iter().chain(extra.iter()) {
        if !nets.contains(net) {
            nets.push(*net);
        }
    }
    nets.sort_by_key(|net| net.prefix_len());
    nets.iter().map(|net| net.to_string()).collect()
}

/// Computes the peer entries for one remote.
///
/// `active_exit` is the exit currently serving the remote, already resolved
/// through any group assignment; `None` means no exit is attached or the
/// failover controller parked the remote on the no-exit sentinel.
pub fn remote_peer_entries(
    access_level: AccessLevel,
    hub_cidrs: &[IpNet],
    advertised_lans: &[IpNet],
    lan_access: &[IpNet],
    custom_allowed_ips: Option<&str>,
    exit_attached: bool,
    active_exit: Option<i64>,
) -> Result<Vec<RemotePeerEntry>, Error> {
    let mut entries = Vec::new();
    match access_level {
        AccessLevel::FullAccess => {
            entries.push(RemotePeerEntry::Hub {
                allowed_ips: merge(hub_cidrs, advertised_lans),
            });
            if let Some(exit_id) = active_exit {
                entries.push(RemotePeerEntry::Exit {
                    exit_id,
                    allowed_ips: default_route(),
                });
            }
        },
        AccessLevel::VpnOnly => {
            entries.push(RemotePeerEntry::Hub {
                allowed_ips: merge(hub_cidrs, &[]),
            });
            if exit_attached {
                if let Some(exit_id) = active_exit {
                    entries.push(RemotePeerEntry::Exit {
                        exit_id,
                        allowed_ips: default_route(),
                    });
                }
            }
        },
        AccessLevel::LanOnly => {
            entries.push(RemotePeerEntry::Hub {
                allowed_ips: merge(hub_cidrs, lan_access),
            });
        },
        AccessLevel::Custom => {
            let custom = custom_allowed_ips.ok_or_else(|| {
                Error::validation("allowed_ips", "custom access level needs explicit AllowedIPs")
            })?;
            entries.push(RemotePeerEntry::Hub {
                allowed_ips: custom
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            });
        },
        AccessLevel::ExitOnly => {
            if !exit_attached {
                return Err(Error::validation(
                    "exit",
                    "exit_only remotes must reference an exit node or exit group",
                ));
            }
            let exit_id = active_exit.ok_or_else(|| {
                Error::validation("exit", "no healthy exit available for exit_only remote")
            })?;
            entries.push(RemotePeerEntry::Exit {
                exit_id,
                allowed_ips: default_route(),
            });
        },
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_cidrs() -> Vec<IpNet> {
        vec!["10.66.0.0/24".parse().unwrap(), "fd66::/64".parse().unwrap()]
    }

    fn lans() -> Vec<IpNet> {
        vec![
            "192.168.10.0/24".parse().unwrap(),
            "192.168.20.0/24".parse().unwrap(),
        ]
    }

    #[test]
    fn full_access_sees_vpn_and_all_lans() {
        let entries = remote_peer_entries(
            AccessLevel::FullAccess,
            &hub_cidrs(),
            &lans(),
            &[],
            None,
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            entries,
            vec![RemotePeerEntry::Hub {
                allowed_ips: vec![
                    "10.66.0.0/24".to_string(),
                    "192.168.10.0/24".to_string(),
                    "192.168.20.0/24".to_string(),
                    "fd66::/64".to_string(),
                ]
            }]
        );
    }

    #[test]
    fn merged_allowed_ips_order_broad_prefixes_first() {
        let wide_lans: Vec<IpNet> = vec![
            "192.168.10.0/24".parse().unwrap(),
            "10.70.0.0/16".parse().unwrap(),
        ];
        let entries = remote_peer_entries(
            AccessLevel::FullAccess,
            &hub_cidrs(),
            &wide_lans,
            &[],
            None,
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            entries,
            vec![RemotePeerEntry::Hub {
                allowed_ips: vec![
                    "10.70.0.0/16".to_string(),
                    "10.66.0.0/24".to_string(),
                    "192.168.10.0/24".to_string(),
                    "fd66::/64".to_string(),
                ]
            }]
        );
    }

    #[test]
    fn full_access_with_exit_adds_default_route_peer() {
        let entries = remote_peer_entries(
            AccessLevel::FullAccess,
            &hub_cidrs(),
            &lans(),
            &[],
            None,
            true,
            Some(3),
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1],
            RemotePeerEntry::Exit {
                exit_id: 3,
                allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()]
            }
        );
    }

    #[test]
    fn vpn_only_sees_only_hub_cidrs() {
        let entries = remote_peer_entries(
            AccessLevel::VpnOnly,
            &hub_cidrs(),
            &lans(),
            &[],
            None,
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            entries,
            vec![RemotePeerEntry::Hub {
                allowed_ips: vec!["10.66.0.0/24".to_string(), "fd66::/64".to_string()]
            }]
        );
    }

    #[test]
    fn lan_only_adds_just_the_granted_subset() {
        let granted: Vec<IpNet> = vec!["192.168.20.0/24".parse().unwrap()];
        let entries = remote_peer_entries(
            AccessLevel::LanOnly,
            &hub_cidrs(),
            &lans(),
            &granted,
            None,
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            entries,
            vec![RemotePeerEntry::Hub {
                allowed_ips: vec![
                    "10.66.0.0/24".to_string(),
                    "192.168.20.0/24".to_string(),
                    "fd66::/64".to_string(),
                ]
            }]
        );
    }

    #[test]
    fn custom_is_passed_through_verbatim() {
        let entries = remote_peer_entries(
            AccessLevel::Custom,
            &hub_cidrs(),
            &lans(),
            &[],
            Some("10.66.0.1/32, 192.168.10.7/32"),
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            entries,
            vec![RemotePeerEntry::Hub {
                allowed_ips: vec!["10.66.0.1/32".to_string(), "192.168.10.7/32".to_string()]
            }]
        );
    }

    #[test]
    fn exit_only_emits_no_hub_peer() {
        let entries = remote_peer_entries(
            AccessLevel::ExitOnly,
            &hub_cidrs(),
            &lans(),
            &[],
            None,
            true,
            Some(9),
        )
        .unwrap();
        assert_eq!(
            entries,
            vec![RemotePeerEntry::Exit {
                exit_id: 9,
                allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()]
            }]
        );
    }

    #[test]
    fn exit_only_without_exit_is_refused() {
        let err = remote_peer_entries(
            AccessLevel::ExitOnly,
            &hub_cidrs(),
            &lans(),
            &[],
            None,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "exit"));
    }

    #[test]
    fn determinism_same_inputs_same_output() {
        let a = remote_peer_entries(
            AccessLevel::FullAccess,
            &hub_cidrs(),
            &lans(),
            &[],
            None,
            true,
            Some(2),
        )
        .unwrap();
        let b = remote_peer_entries(
            AccessLevel::FullAccess,
            &hub_cidrs(),
            &lans(),
            &[],
            None,
            true,
            Some(2),
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
