// Address allocator

//! Address allocation from the WAN pools
//!
//! The allocator keeps no pool state. Availability is recomputed on every call
//! from the addresses currently owned by peers and services, so releasing an
//! address is just deleting its owner.

use crate::cidr;
use crate::model::OverlayModel;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Return the lowest free host address in `pool`
///
/// Addresses in `allocated` or `exclude` are skipped. Fails with
/// [`Error::Exhausted`] once every host address is taken.
pub fn allocate(
    pool: &Ipv4Net,
    allocated: &HashSet<Ipv4Addr>,
    exclude: &HashSet<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    let address = cidr::hosts(pool)
        .find(|addr| !allocated.contains(addr) && !exclude.contains(addr))
        .ok_or_else(|| Error::Exhausted {
            pool: pool.to_string(),
        })?;
    log::debug!("Allocated {} from {}", address, pool);
    Ok(address)
}

/// Accept a caller-chosen address if it is a free host address of `pool`
pub fn reserve(
    pool: &Ipv4Net,
    address: Ipv4Addr,
    allocated: &HashSet<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    let unavailable = |reason: &str| Error::Unavailable {
        address,
        pool: pool.to_string(),
        reason: reason.to_string(),
    };

    if !pool.contains(&address) {
        return Err(unavailable("outside the pool"));
    }
    if cidr::host_count(pool) == 0
        || address == pool.network()
        || address == pool.broadcast()
    {
        return Err(unavailable("not a host address"));
    }
    if allocated.contains(&address) {
        return Err(unavailable("already allocated"));
    }
    Ok(address)
}

/// Tunnel addresses owned by the peers of a WAN
pub fn tunnel_addresses_in_use(model: &OverlayModel) -> HashSet<Ipv4Addr> {
    model
        .peers
        .iter()
        .filter_map(|p| p.tunnel_address)
        .collect()
}

/// Shared-service addresses owned by active services of a WAN
pub fn shared_addresses_in_use(model: &OverlayModel) -> HashSet<Ipv4Addr> {
    model
        .services
        .iter()
        .filter(|s| s.active)
        .filter_map(|s| s.shared_address)
        .collect()
}

/// Summary of a pool, as shown to operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    /// Network address
    pub network: Ipv4Addr,
    /// Broadcast address
    pub broadcast: Ipv4Addr,
    /// Prefix length
    pub prefix_len: u8,
    /// Usable host addresses
    pub host_count: u32,
    /// Lowest usable address
    pub first_host: Option<Ipv4Addr>,
    /// Highest usable address
    pub last_host: Option<Ipv4Addr>,
}

/// Describe a pool
pub fn pool_info(pool: &Ipv4Net) -> PoolInfo {
    let count = cidr::host_count(pool);
    let (first_host, last_host) = if count == 0 {
        (None, None)
    } else {
        (
            Some(Ipv4Addr::from(cidr::first(pool) + 1)),
            Some(Ipv4Addr::from(cidr::last(pool) - 1)),
        )
    };
    PoolInfo {
        network: pool.network(),
        broadcast: pool.broadcast(),
        prefix_len: pool.prefix_len(),
        host_count: count,
        first_host,
        last_host,
    }
}
