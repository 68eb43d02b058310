// Subnet conflict detection

//! Conflict detection for peer local subnets
//!
//! Each of a peer's local subnets is checked against the WAN's tunnel and
//! shared-service ranges (critical) and against other peers' routed subnets
//! (warning). Conflicts carry a machine-readable kind and a list of suggested
//! resolutions so automation can act on them without re-deriving anything.

use crate::cidr;
use crate::model::{LocalSubnet, OverlayModel, Peer};
use ipnet::Ipv4Net;
use serde::Serialize;
use uuid::Uuid;

/// How badly a conflict affects the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// May cause ambiguous routing
    Warning,
    /// Breaks the overlay's own addressing
    Critical,
}

/// What a subnet collides with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Overlap with the WAN tunnel range
    TunnelOverlap,
    /// Overlap with the WAN shared-service range
    SharedServicesOverlap,
    /// Overlap with another peer's routed subnet
    Routing,
    /// Overlap with a route already present on the device
    ExistingRoute,
}

impl ConflictKind {
    /// Critical conflicts block deployment
    pub fn severity(&self) -> Severity {
        match self {
            ConflictKind::TunnelOverlap | ConflictKind::SharedServicesOverlap => Severity::Critical,
            ConflictKind::Routing | ConflictKind::ExistingRoute => Severity::Warning,
        }
    }

    /// Resolutions worth suggesting for this kind
    pub fn resolutions(&self) -> Vec<Resolution> {
        use Resolution::*;
        match self {
            ConflictKind::TunnelOverlap | ConflictKind::SharedServicesOverlap => {
                vec![DontRoute, UseNat, ChangeSubnet]
            }
            ConflictKind::Routing => vec![UseNat, SelectiveRouting, ChangeSubnet],
            ConflictKind::ExistingRoute => vec![DontRoute, SelectiveRouting, ChangeSubnet],
        }
    }
}

/// Ways an operator can resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    /// Mark the subnet service-only
    DontRoute,
    /// Expose the subnet through a translated range
    UseNat,
    /// Renumber the subnet on site
    ChangeSubnet,
    /// Route only to a subset of peers
    SelectiveRouting,
}

/// One detected overlap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    /// Peer owning the subnet
    pub peer_id: Uuid,
    /// The subnet as configured
    pub subnet: Ipv4Net,
    /// What it collides with
    pub kind: ConflictKind,
    /// Whether it blocks deployment
    pub severity: Severity,
    /// Human label of the other side ("WAN tunnel range", "peer site-b", ...)
    pub conflicting_with: String,
    /// The other range
    pub conflicting_subnet: Ipv4Net,
    /// Message shown to operators
    pub description: String,
    /// Ways out, best first
    pub suggested_resolutions: Vec<Resolution>,
    /// The subnet is service-only or a NAT translation sidesteps this overlap
    pub resolved: bool,
}

impl Conflict {
    fn new(
        peer: &Peer,
        subnet: &LocalSubnet,
        kind: ConflictKind,
        conflicting_with: String,
        conflicting_subnet: Ipv4Net,
        resolved: bool,
    ) -> Self {
        let description = format!(
            "Subnet {} of {} overlaps {} ({})",
            subnet.cidr, peer.name, conflicting_with, conflicting_subnet
        );
        Self {
            peer_id: peer.id,
            subnet: subnet.cidr,
            kind,
            severity: kind.severity(),
            conflicting_with,
            conflicting_subnet,
            description,
            suggested_resolutions: kind.resolutions(),
            resolved,
        }
    }
}

/// A WAN range overlap stops mattering once the subnet is service-only or its
/// translated block no longer touches the range
fn sidestepped(subnet: &LocalSubnet, range: &Ipv4Net) -> bool {
    !subnet.routed || !cidr::overlaps(&subnet.advertised(), range)
}

/// Conflicts for every local subnet of `peer` within its WAN
pub fn detect(peer: &Peer, model: &OverlayModel) -> Vec<Conflict> {
    let wan = &model.wan;
    let mut conflicts = Vec::new();

    for subnet in &peer.subnets {
        if cidr::overlaps(&subnet.cidr, &wan.tunnel_range) {
            conflicts.push(Conflict::new(
                peer,
                subnet,
                ConflictKind::TunnelOverlap,
                "WAN tunnel range".to_string(),
                wan.tunnel_range,
                sidestepped(subnet, &wan.tunnel_range),
            ));
        }
        if cidr::overlaps(&subnet.cidr, &wan.shared_range) {
            conflicts.push(Conflict::new(
                peer,
                subnet,
                ConflictKind::SharedServicesOverlap,
                "WAN shared-service range".to_string(),
                wan.shared_range,
                sidestepped(subnet, &wan.shared_range),
            ));
        }

        // Service-only subnets are never routed, so they cannot collide in routing
        if !subnet.routed {
            continue;
        }
        for other in model.peers.iter().filter(|p| p.id != peer.id) {
            for theirs in other.advertised_subnets() {
                if cidr::overlaps(&subnet.cidr, &theirs.cidr) {
                    let resolved = !cidr::overlaps(&subnet.advertised(), &theirs.advertised());
                    conflicts.push(Conflict::new(
                        peer,
                        subnet,
                        ConflictKind::Routing,
                        format!("peer {}", other.name),
                        theirs.cidr,
                        resolved,
                    ));
                }
            }
        }
    }

    conflicts
}

/// Conflicts of `peer`'s routed subnets with routes already on its device
pub fn detect_existing_routes(peer: &Peer, existing: &[Ipv4Net]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for subnet in peer.advertised_subnets() {
        for route in existing {
            // A default route overlaps everything and says nothing useful
            if route.prefix_len() == 0 {
                continue;
            }
            if cidr::overlaps(&subnet.cidr, route) {
                conflicts.push(Conflict::new(
                    peer,
                    subnet,
                    ConflictKind::ExistingRoute,
                    "existing device route".to_string(),
                    *route,
                    false,
                ));
            }
        }
    }
    conflicts
}

/// Conflicts across all peers of a WAN
pub fn detect_all(model: &OverlayModel) -> Vec<Conflict> {
    model
        .peers
        .iter()
        .flat_map(|peer| detect(peer, model))
        .collect()
}

/// Unresolved critical conflicts block deployment of a peer
pub fn blocking(conflicts: &[Conflict]) -> Vec<&Conflict> {
    conflicts
        .iter()
        .filter(|c| c.severity == Severity::Critical && !c.resolved)
        .collect()
}
