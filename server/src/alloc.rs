//! VPN address allocation.
//!
//! New peers get the first free address at or above the lowest address of
//! their own category (router, remote, exit), so gaps left by removed peers
//! are refilled before the range grows. When the category is empty the scan
//! starts at the first assignable host of the network. Network, broadcast
//! and hub addresses are never handed out.

use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use ipnet::{Ipv4Net, Ipv6Net};

use crate::Error;

pub fn next_free_v4(
    cidr: Ipv4Net,
    category_used: &[Ipv4Addr],
    all_used: &HashSet<IpAddr>,
) -> Result<Ipv4Addr, Error> {
    let network = u32::from(cidr.network());
    let broadcast = u32::from(cidr.broadcast());
    let first_host = if cidr.prefix_len() < 31 {
        network + 1
    } else {
        network
    };
    let last_host = if cidr.prefix_len() < 31 {
        broadcast.saturating_sub(1)
    } else {
        broadcast
    };

    let start = category_used
        .iter()
        .map(|a| u32::from(*a))
        .min()
        .unwrap_or(first_host)
        .max(first_host);

    let scan = (start..=last_host).chain(first_host..start);
    for candidate in scan {
        let addr = Ipv4Addr::from(candidate);
        if !all_used.contains(&IpAddr::V4(addr)) {
            return Ok(addr);
        }
    }
    Err(Error::validation(
        "address",
        format!("no free v4 addresses left in {cidr}"),
    ))
}

pub fn next_free_v6(
    cidr: Ipv6Net,
    category_used: &[Ipv6Addr],
    all_used: &HashSet<IpAddr>,
) -> Result<Ipv6Addr, Error> {
    let network = u128::from(cidr.network());
    let last = u128::from(cidr.broadcast());
    let first_host = network + 1;

    let start = category_used
        .iter()
        .map(|a| u128::from(*a))
        .min()
        .unwrap_or(first_host)
        .max(first_host);

    // v6 ranges are sparse; a bounded forward scan is always enough.
    let mut candidate = start;
    for _ in 0..1_000_000u32 {
        if candidate > last {
            candidate = first_host;
        }
        let addr = Ipv6Addr::from(candidate);
        if !all_used.contains(&IpAddr::V6(addr)) {
            return Ok(addr);
        }
        candidate += 1;
    }
    Err(Error::validation(
        "address",
        format!("no free v6 addresses found in {cidr}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn used(addrs: &[&str]) -> HashSet<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn fills_the_gap_inside_the_category_range() {
        // Hub at .1, a router at .20, remotes at .30, .31 and .33: the next
        // remote lands on .32, not on the low gap at .2.
        let cidr: Ipv4Net = "10.66.0.0/24".parse().unwrap();
        let all = used(&[
            "10.66.0.1",
            "10.66.0.20",
            "10.66.0.30",
            "10.66.0.31",
            "10.66.0.33",
        ]);
        let category: Vec<Ipv4Addr> = ["10.66.0.30", "10.66.0.31", "10.66.0.33"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        let next = next_free_v4(cidr, &category, &all).unwrap();
        assert_eq!(next, "10.66.0.32".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn empty_category_starts_after_the_network_address() {
        let cidr: Ipv4Net = "10.66.0.0/24".parse().unwrap();
        let all = used(&["10.66.0.1"]);
        let next = next_free_v4(cidr, &[], &all).unwrap();
        assert_eq!(next, "10.66.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn wraps_to_earlier_gaps_when_the_tail_is_full() {
        let cidr: Ipv4Net = "10.66.0.0/30".parse().unwrap();
        // Hosts are .1 and .2; category starts at .2 which is taken, so the
        // scan wraps to .1.
        let all = used(&["10.66.0.2"]);
        let category: Vec<Ipv4Addr> = vec!["10.66.0.2".parse().unwrap()];
        let next = next_free_v4(cidr, &category, &all).unwrap();
        assert_eq!(next, "10.66.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn exhausted_network_errors() {
        let cidr: Ipv4Net = "10.66.0.0/30".parse().unwrap();
        let all = used(&["10.66.0.1", "10.66.0.2"]);
        assert!(matches!(
            next_free_v4(cidr, &[], &all),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn v6_allocation_scans_forward() {
        let cidr: Ipv6Net = "fd66::/64".parse().unwrap();
        let all = used(&["fd66::1", "fd66::2"]);
        let category: Vec<Ipv6Addr> = vec!["fd66::2".parse().unwrap()];
        let next = next_free_v6(cidr, &category, &all).unwrap();
        assert_eq!(next, "fd66::3".parse::<Ipv6Addr>().unwrap());
    }
}
