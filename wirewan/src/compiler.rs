// Desired-state compiler

//! Desired-state compilation
//!
//! [`compile`] turns the abstract overlay model into the full target
//! configuration of one device. It is a pure function: no I/O, and for the same
//! inputs it always yields the same descriptors in the same order (remotes,
//! subnets and services are visited sorted by id, address lists are sorted).

use crate::cidr;
use crate::descriptor::{
    AddressDescriptor, DeviceState, FirewallRuleDescriptor, InterfaceDescriptor,
    NatRuleDescriptor, OwnershipTag, PeerDescriptor, RouteDescriptor,
};
use crate::model::{Peer, PublishedService, TopologyMode, WanNetwork};
use crate::types::DefaultsConfig;
use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};

/// Interface name used on a peer's device
pub fn interface_name(peer: &Peer, wan: &WanNetwork, defaults: &DefaultsConfig) -> String {
    peer.management
        .as_ref()
        .and_then(|m| m.interface_name.clone())
        .or_else(|| defaults.interface_name.clone())
        .unwrap_or_else(|| wan.interface_name())
}

/// Whether `local` should carry a direct WireGuard peer entry for `remote`
pub fn connects(local: &Peer, remote: &Peer, topology: TopologyMode) -> bool {
    if local.id == remote.id {
        return false;
    }
    match topology {
        TopologyMode::Mesh => true,
        TopologyMode::HubSpoke => local.is_hub() || remote.is_hub(),
        TopologyMode::Hybrid => local.is_hub() || remote.is_hub() || local.paired_with(remote),
    }
}

/// Networks a remote peer answers for
struct RemoteNetworks {
    allowed: BTreeSet<Ipv4Net>,
    routes: Vec<(Ipv4Net, OwnershipTag)>,
}

fn remote_networks(
    local: &Peer,
    remote: &Peer,
    services: &[&PublishedService],
) -> RemoteNetworks {
    let mut allowed = BTreeSet::new();
    let mut routes = Vec::new();

    if let Some(addr) = remote.tunnel_address {
        allowed.insert(cidr::host_route(addr));
    }

    let mut subnets: Vec<_> = remote.advertised_subnets().collect();
    subnets.sort_by_key(|s| s.id);
    for subnet in subnets {
        let advertised = subnet.advertised();
        if local
            .subnets
            .iter()
            .any(|own| cidr::overlaps(&own.cidr, &advertised))
        {
            log::warn!(
                "Not routing {} of {} on {}: overlaps a local subnet",
                advertised,
                remote.name,
                local.name
            );
            continue;
        }
        allowed.insert(advertised);
        routes.push((advertised, OwnershipTag::new(format!("route-{}", subnet.id))));
    }

    for service in services
        .iter()
        .filter(|s| s.peer_id == remote.id && s.active)
    {
        if let Some(addr) = service.shared_address {
            allowed.insert(cidr::host_route(addr));
        }
    }

    RemoteNetworks { allowed, routes }
}

fn join(networks: &BTreeSet<Ipv4Net>) -> String {
    networks
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Compile the desired configuration of `peer`'s device
///
/// `all_peers` and `all_services` cover the whole WAN; the peer itself may be
/// included. Fails when the peer has no tunnel address yet.
pub fn compile(
    peer: &Peer,
    wan: &WanNetwork,
    all_peers: &[Peer],
    all_services: &[PublishedService],
    defaults: &DefaultsConfig,
) -> Result<DeviceState> {
    let tunnel_address = peer.tunnel_address.ok_or_else(|| {
        Error::InvalidModel(format!("peer {} has no tunnel address", peer.name))
    })?;
    let iface = interface_name(peer, wan, defaults);

    let mut remotes: Vec<&Peer> = all_peers
        .iter()
        .filter(|p| p.id != peer.id && p.wan_id == wan.id && p.is_active())
        .collect();
    remotes.sort_by_key(|p| p.id);

    let mut services: Vec<&PublishedService> = all_services.iter().collect();
    services.sort_by_key(|s| s.id);

    let (direct, indirect): (Vec<&Peer>, Vec<&Peer>) = remotes
        .iter()
        .copied()
        .partition(|remote| connects(peer, remote, wan.topology));

    // Spokes reach everything they do not peer with through the first hub
    let transit = if peer.is_hub() {
        None
    } else {
        direct.iter().find(|p| p.is_hub()).map(|hub| hub.id)
    };
    if transit.is_none() && !indirect.is_empty() {
        log::warn!(
            "{} has no hub to reach {} remote peer(s) through",
            peer.name,
            indirect.len()
        );
    }

    // Full-tunnel peers send everything else to one remote only, so each
    // allowed-address range keeps a single owner
    let default_via = if peer.route_all_traffic {
        let reachable = |p: &&&Peer| p.endpoint_parts().is_some();
        direct
            .iter()
            .filter(reachable)
            .find(|p| Some(p.id) == transit)
            .or_else(|| direct.iter().find(reachable))
            .map(|p| p.id)
    } else {
        None
    };
    if peer.route_all_traffic && default_via.is_none() {
        log::warn!("{} routes all traffic but no remote has an endpoint", peer.name);
    }

    let mut state = DeviceState::default();
    let mut routes: BTreeMap<Ipv4Net, OwnershipTag> = BTreeMap::new();

    let mut transit_allowed = BTreeSet::new();
    if transit.is_some() {
        for remote in &indirect {
            let networks = remote_networks(peer, remote, &services);
            transit_allowed.extend(networks.allowed);
            for (dst, tag) in networks.routes {
                routes.entry(dst).or_insert(tag);
            }
        }
    }

    for remote in &direct {
        let mut networks = remote_networks(peer, remote, &services);
        if transit == Some(remote.id) {
            networks.allowed.extend(transit_allowed.iter().copied());
        }
        networks.allowed.insert(wan.shared_range);
        if default_via == Some(remote.id) {
            networks.allowed.insert(Ipv4Net::default());
        }
        for (dst, tag) in networks.routes {
            routes.entry(dst).or_insert(tag);
        }

        let endpoint = remote.endpoint_parts();
        let keepalive = remote
            .persistent_keepalive
            .unwrap_or(defaults.persistent_keepalive);
        state.peers.push(PeerDescriptor {
            id: None,
            interface: iface.clone(),
            public_key: remote.public_key.clone().unwrap_or_default(),
            endpoint_address: endpoint.as_ref().map(|(host, _)| host.clone()),
            endpoint_port: endpoint.as_ref().map(|(_, port)| port.to_string()),
            allowed_address: join(&networks.allowed),
            persistent_keepalive: (keepalive > 0).then(|| format!("{}s", keepalive)),
            last_handshake: None,
            tag: OwnershipTag::new(format!("peer-{}", remote.id)),
        });
    }

    state.interfaces.push(InterfaceDescriptor {
        id: None,
        name: iface.clone(),
        listen_port: peer.listen_port.unwrap_or(defaults.listen_port),
        private_key: peer.private_key.clone(),
        running: None,
        tag: OwnershipTag::new(format!("iface-{}", peer.id)),
    });

    state.addresses.push(AddressDescriptor {
        id: None,
        address: format!("{}/{}", tunnel_address, wan.tunnel_range.prefix_len()),
        interface: iface.clone(),
        tag: OwnershipTag::new(format!("addr-{}", peer.id)),
    });

    routes
        .entry(wan.shared_range)
        .or_insert_with(|| OwnershipTag::new(format!("route-shared-{}", wan.id)));
    state.routes = routes
        .into_iter()
        .map(|(dst_address, tag)| RouteDescriptor {
            id: None,
            dst_address,
            gateway: iface.clone(),
            tag,
        })
        .collect();

    state.firewall = firewall_rules(peer, &iface);
    state.nat = nat_rules(peer, &services, &iface);

    log::debug!(
        "Compiled {} descriptors for {} ({} remote peers)",
        state.len(),
        peer.name,
        state.peers.len()
    );
    Ok(state)
}

fn firewall_rules(peer: &Peer, iface: &str) -> Vec<FirewallRuleDescriptor> {
    let rule = |chain: &str, inbound: bool, suffix: &str| FirewallRuleDescriptor {
        id: None,
        chain: chain.to_string(),
        action: "accept".to_string(),
        in_interface: inbound.then(|| iface.to_string()),
        out_interface: (!inbound).then(|| iface.to_string()),
        tag: OwnershipTag::new(format!("{}-{}", suffix, peer.id)),
    };
    vec![
        rule("input", true, "allow-input-wan"),
        rule("forward", true, "allow-from-wan"),
        rule("forward", false, "allow-to-wan"),
    ]
}

fn nat_rules(peer: &Peer, services: &[&PublishedService], iface: &str) -> Vec<NatRuleDescriptor> {
    let mut rules = Vec::new();

    for service in services.iter().filter(|s| s.peer_id == peer.id && s.active) {
        let Some(shared) = service.shared_address else {
            log::warn!("Service {} has no shared address, skipping", service.name);
            continue;
        };
        for proto in service.protocol.concrete() {
            rules.push(NatRuleDescriptor {
                chain: "dstnat".to_string(),
                action: "dst-nat".to_string(),
                protocol: Some(proto.to_string()),
                dst_address: Some(shared.to_string()),
                dst_port: service.shared_port.map(|p| p.to_string()),
                to_addresses: Some(service.local_address.to_string()),
                to_ports: (service.local_port > 0).then(|| service.local_port.to_string()),
                tag: OwnershipTag::new(format!("service-{}-{}", service.id, proto)),
                ..Default::default()
            });
            rules.push(NatRuleDescriptor {
                chain: "srcnat".to_string(),
                action: "src-nat".to_string(),
                protocol: Some(proto.to_string()),
                src_address: Some(service.local_address.to_string()),
                out_interface: Some(iface.to_string()),
                to_addresses: Some(shared.to_string()),
                tag: OwnershipTag::new(format!("service-{}-{}-srcnat", service.id, proto)),
                ..Default::default()
            });
        }
    }

    let mut subnets: Vec<_> = peer.subnets.iter().collect();
    subnets.sort_by_key(|s| s.id);
    for subnet in subnets {
        let (true, Some(translated)) = (subnet.nat, subnet.translated) else {
            continue;
        };
        rules.push(NatRuleDescriptor {
            chain: "dstnat".to_string(),
            action: "netmap".to_string(),
            dst_address: Some(translated.to_string()),
            in_interface: Some(iface.to_string()),
            to_addresses: Some(subnet.cidr.to_string()),
            tag: OwnershipTag::new(format!("subnet-{}-dstnat", subnet.id)),
            ..Default::default()
        });
        rules.push(NatRuleDescriptor {
            chain: "srcnat".to_string(),
            action: "netmap".to_string(),
            src_address: Some(subnet.cidr.to_string()),
            out_interface: Some(iface.to_string()),
            to_addresses: Some(translated.to_string()),
            tag: OwnershipTag::new(format!("subnet-{}-srcnat", subnet.id)),
            ..Default::default()
        });
    }

    rules
}
