// CIDR helpers

//! CIDR parsing and range arithmetic
//!
//! Thin helpers over [`ipnet::Ipv4Net`]: parsing with host bits cleared, the
//! overlap test used by conflict detection and translation, and host
//! enumeration used by the allocator.

use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Parse CIDR notation, clearing any host bits (`192.168.1.7/24` -> `192.168.1.0/24`)
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = cidr
        .trim()
        .parse()
        .map_err(|e| Error::InvalidCidr(format!("{}: {}", cidr, e)))?;
    Ok(net.trunc())
}

/// First address of a range as an integer
pub fn first(net: &Ipv4Net) -> u32 {
    u32::from(net.network())
}

/// Last address of a range as an integer
pub fn last(net: &Ipv4Net) -> u32 {
    u32::from(net.broadcast())
}

/// Two ranges intersect iff neither starts strictly after the other ends
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    !(first(a) > last(b) || first(b) > last(a))
}

/// Check whether an address falls inside any of the given ranges
pub fn ip_in_subnets(ip: Ipv4Addr, subnets: &[Ipv4Net]) -> bool {
    subnets.iter().any(|net| net.contains(&ip))
}

/// Usable host addresses in ascending order
///
/// Network and broadcast addresses are skipped. /31 and /32 ranges have no
/// usable hosts.
pub fn hosts(net: &Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    let (start, end) = if net.prefix_len() >= 31 {
        (1, 0)
    } else {
        (first(net) + 1, last(net) - 1)
    };
    (start..=end).map(Ipv4Addr::from)
}

/// Number of usable host addresses
pub fn host_count(net: &Ipv4Net) -> u32 {
    if net.prefix_len() >= 31 {
        0
    } else {
        last(net) - first(net) - 1
    }
}

/// Same address with a /32 prefix
pub fn host_route(ip: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let net = parse_cidr("192.168.1.0/24").unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(net.netmask(), Ipv4Addr::new(255, 255, 255, 0));

        let net = parse_cidr("10.0.0.1/32").unwrap();
        assert_eq!(net.network(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(net.prefix_len(), 32);
    }

    #[test]
    fn test_parse_cidr_invalid() {
        assert!(parse_cidr("invalid").is_err());
        assert!(parse_cidr("192.168.1.0").is_err());
        assert!(parse_cidr("192.168.1.0/").is_err());
        assert!(parse_cidr("192.168.1.0/33").is_err());
        assert!(parse_cidr("999.999.999.999/24").is_err());
    }

    #[test]
    fn test_parse_cidr_network_bits_cleared() {
        let net = parse_cidr("192.168.1.100/24").unwrap();
        assert_eq!(net.to_string(), "192.168.1.0/24");

        let net = parse_cidr("10.0.0.255/8").unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_overlaps() {
        let tunnel = parse_cidr("10.0.0.0/24").unwrap();
        assert!(overlaps(&tunnel, &parse_cidr("10.0.0.0/25").unwrap()));
        assert!(overlaps(&parse_cidr("10.0.0.128/25").unwrap(), &tunnel));
        assert!(overlaps(&parse_cidr("10.0.0.0/8").unwrap(), &tunnel));
        assert!(!overlaps(&tunnel, &parse_cidr("10.0.1.0/24").unwrap()));
        assert!(!overlaps(
            &parse_cidr("192.168.1.0/24").unwrap(),
            &parse_cidr("192.168.2.0/24").unwrap()
        ));
    }

    #[test]
    fn test_hosts_skip_network_and_broadcast() {
        let net = parse_cidr("10.0.0.0/30").unwrap();
        let hosts: Vec<_> = hosts(&net).collect();
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
        assert_eq!(host_count(&net), 2);
    }

    #[test]
    fn test_hosts_point_to_point_ranges_are_empty() {
        assert_eq!(hosts(&parse_cidr("10.0.0.0/31").unwrap()).count(), 0);
        assert_eq!(hosts(&parse_cidr("10.0.0.1/32").unwrap()).count(), 0);
        assert_eq!(host_count(&parse_cidr("10.0.0.0/31").unwrap()), 0);
    }

    #[test]
    fn test_ip_in_subnets() {
        let subnets = vec![
            parse_cidr("192.168.0.0/16").unwrap(),
            parse_cidr("10.1.0.0/24").unwrap(),
        ];
        assert!(ip_in_subnets(Ipv4Addr::new(192, 168, 7, 1), &subnets));
        assert!(ip_in_subnets(Ipv4Addr::new(10, 1, 0, 9), &subnets));
        assert!(!ip_in_subnets(Ipv4Addr::new(10, 1, 1, 9), &subnets));
    }
}
