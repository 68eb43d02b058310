// Overlay data model

//! Abstract overlay model
//!
//! Plain records handed to the engine by the persistence collaborator: the WAN
//! network with its two address pools, the peers that join it (with their local
//! subnets), and the services peers publish into the shared-service range.

use crate::cidr;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Default WireGuard listen port
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Default keepalive interval in seconds
pub const DEFAULT_KEEPALIVE: u16 = 25;

/// How peers of a WAN connect to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyMode {
    /// Every peer connects to every other peer
    Mesh,
    /// Spokes connect only to hubs
    HubSpoke,
    /// Hub-spoke plus explicitly paired direct links
    Hybrid,
}

/// Kind of device a peer represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    /// Router whose configuration this engine deploys (MikroTik)
    ManagedRouter,
    /// Router configured by hand from an exported config
    GenericRouter,
    /// Single host
    Server,
    /// Roaming client
    Client,
    /// Transit point for spokes
    Hub,
}

/// Last known state of a peer's management API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiStatus {
    /// Never checked
    #[default]
    Unknown,
    /// Last check authenticated
    Connected,
    /// Credentials were rejected
    AuthFailed,
    /// Device did not answer
    Unreachable,
}

/// Transport protocol of a published service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP only
    #[default]
    Tcp,
    /// UDP only
    Udp,
    /// One rule per protocol
    Both,
}

impl Protocol {
    /// Concrete protocol names a rule must be emitted for
    pub fn concrete(&self) -> &'static [&'static str] {
        match self {
            Protocol::Tcp => &["tcp"],
            Protocol::Udp => &["udp"],
            Protocol::Both => &["tcp", "udp"],
        }
    }
}

/// A WireGuard overlay spanning several sites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WanNetwork {
    /// WAN identifier
    pub id: Uuid,
    /// Display name, also the source of the interface name
    pub name: String,
    /// Pool for peer tunnel addresses
    pub tunnel_range: Ipv4Net,
    /// Pool for published-service addresses
    pub shared_range: Ipv4Net,
    /// Which peers connect directly
    pub topology: TopologyMode,
}

impl WanNetwork {
    /// Check the tunnel and shared-service pools are disjoint
    pub fn validate(&self) -> Result<()> {
        if cidr::overlaps(&self.tunnel_range, &self.shared_range) {
            return Err(Error::InvalidModel(format!(
                "WAN {}: tunnel range {} overlaps shared-service range {}",
                self.name, self.tunnel_range, self.shared_range
            )));
        }
        Ok(())
    }

    /// Interface name derived from the WAN identity
    pub fn interface_name(&self) -> String {
        let slug: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let slug = slug.trim_matches('-');
        if slug.is_empty() {
            format!("wg-{}", &self.id.simple().to_string()[..8])
        } else {
            let mut name = format!("wg-{}", slug);
            name.truncate(32);
            name
        }
    }
}

/// Credentials and connection settings for a managed router's API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagementAccess {
    /// API host name or address
    pub host: String,
    /// API port, defaulted from config when unset
    #[serde(default)]
    pub port: Option<u16>,
    /// API user
    pub username: String,
    /// API password
    #[serde(default)]
    pub password: String,
    /// Talk HTTPS instead of HTTP
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Reject self-signed certificates
    #[serde(default)]
    pub verify_cert: bool,
    /// Overrides the interface name derived from the WAN
    #[serde(default)]
    pub interface_name: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A network behind a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSubnet {
    /// Subnet identifier
    pub id: Uuid,
    /// Range as configured on site
    pub cidr: Ipv4Net,
    /// Participates in overlay routing (false = service-only)
    #[serde(default = "default_true")]
    pub routed: bool,
    /// Expose the subnet through a translated range
    #[serde(default)]
    pub nat: bool,
    /// Replacement range, present only when `nat` is set
    #[serde(default)]
    pub translated: Option<Ipv4Net>,
}

impl LocalSubnet {
    /// The range other peers route to reach this subnet
    pub fn advertised(&self) -> Ipv4Net {
        match (self.nat, self.translated) {
            (true, Some(translated)) => translated,
            _ => self.cidr,
        }
    }
}

/// A site participating in the overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer identifier
    pub id: Uuid,
    /// WAN the peer belongs to
    pub wan_id: Uuid,
    /// Unique display name
    pub name: String,
    /// What kind of device this is
    pub device_type: DeviceType,
    /// WireGuard public key
    #[serde(default)]
    pub public_key: Option<String>,
    /// Key material supplied by the record, never generated here
    #[serde(default)]
    pub private_key: Option<String>,
    /// Address inside the WAN tunnel range
    #[serde(default)]
    pub tunnel_address: Option<Ipv4Addr>,
    /// `host:port` the peer can be reached on
    #[serde(default)]
    pub endpoint: Option<String>,
    /// WireGuard listen port override
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Keepalive override in seconds, 0 disables it
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    /// Redeploy automatically when the overlay changes
    #[serde(default)]
    pub auto_deploy: bool,
    /// Send all traffic, not just overlay ranges, through the tunnel
    #[serde(default)]
    pub route_all_traffic: bool,
    /// Peers this one is explicitly paired with (hybrid topology)
    #[serde(default)]
    pub direct_peers: Vec<Uuid>,
    /// API access, required for managed routers
    #[serde(default)]
    pub management: Option<ManagementAccess>,
    /// Networks behind the peer
    #[serde(default)]
    pub subnets: Vec<LocalSubnet>,
    /// Result of the last connection test
    #[serde(default)]
    pub api_status: ApiStatus,
    /// When the last connection test ran
    #[serde(default)]
    pub last_api_check: Option<DateTime<Utc>>,
    /// Identity the router reported
    #[serde(default)]
    pub router_identity: Option<String>,
    /// RouterOS version the router reported
    #[serde(default)]
    pub router_version: Option<String>,
}

impl Peer {
    /// Eligible as a remote in compiled configurations
    pub fn is_active(&self) -> bool {
        self.public_key.as_deref().is_some_and(|k| !k.is_empty()) && self.tunnel_address.is_some()
    }

    /// Whether this engine deploys configuration onto the peer
    pub fn is_managed(&self) -> bool {
        self.device_type == DeviceType::ManagedRouter
    }

    /// Hubs carry traffic for spokes
    pub fn is_hub(&self) -> bool {
        self.device_type == DeviceType::Hub
    }

    /// Split the endpoint into host and port (port defaults to 51820)
    pub fn endpoint_parts(&self) -> Option<(String, u16)> {
        let endpoint = self.endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }
        match endpoint.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => Some((host.to_string(), port)),
                Err(_) => Some((endpoint.to_string(), DEFAULT_LISTEN_PORT)),
            },
            None => Some((endpoint.to_string(), DEFAULT_LISTEN_PORT)),
        }
    }

    /// Routed subnets in the form other peers should see them
    pub fn advertised_subnets(&self) -> impl Iterator<Item = &LocalSubnet> {
        self.subnets.iter().filter(|s| s.routed)
    }

    /// Explicit pairing in either direction
    pub fn paired_with(&self, other: &Peer) -> bool {
        self.direct_peers.contains(&other.id) || other.direct_peers.contains(&self.id)
    }
}

/// A local service exposed to the whole overlay at a shared address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedService {
    /// Service identifier
    pub id: Uuid,
    /// Peer hosting the service
    pub peer_id: Uuid,
    /// Display name
    pub name: String,
    /// Address of the service on the local network
    pub local_address: Ipv4Addr,
    /// 0 means "same as the shared port" / all ports
    #[serde(default)]
    pub local_port: u16,
    /// Protocols forwarded
    #[serde(default)]
    pub protocol: Protocol,
    /// Address inside the WAN shared-service range
    #[serde(default)]
    pub shared_address: Option<Ipv4Addr>,
    /// Absent means all ports
    #[serde(default)]
    pub shared_port: Option<u16>,
    /// Inactive services are neither routed nor forwarded
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Everything the engine needs to know about one WAN
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayModel {
    /// The WAN itself
    pub wan: WanNetwork,
    /// Its peers
    #[serde(default)]
    pub peers: Vec<Peer>,
    /// Services published across it
    #[serde(default)]
    pub services: Vec<PublishedService>,
}

impl OverlayModel {
    /// Find a peer by id or by name
    pub fn find_peer(&self, key: &str) -> Option<&Peer> {
        match Uuid::parse_str(key) {
            Ok(id) => self.peers.iter().find(|p| p.id == id),
            Err(_) => self.peers.iter().find(|p| p.name == key),
        }
    }

    /// Services owned by a peer
    pub fn services_of(&self, peer_id: Uuid) -> impl Iterator<Item = &PublishedService> {
        self.services.iter().filter(move |s| s.peer_id == peer_id)
    }

    /// Enforce the model invariants
    ///
    /// Pools are disjoint, tunnel and shared addresses are unique and inside
    /// their pool, translated ranges are unique across the WAN and only set on
    /// NAT subnets.
    pub fn validate(&self) -> Result<()> {
        self.wan.validate()?;

        let mut tunnel_addresses = HashSet::new();
        let mut translated = Vec::new();
        for peer in &self.peers {
            if peer.wan_id != self.wan.id {
                return Err(Error::WanNotFound(peer.wan_id));
            }
            if let Some(addr) = peer.tunnel_address {
                if !self.wan.tunnel_range.contains(&addr) {
                    return Err(Error::InvalidModel(format!(
                        "peer {}: tunnel address {} outside {}",
                        peer.name, addr, self.wan.tunnel_range
                    )));
                }
                if !tunnel_addresses.insert(addr) {
                    return Err(Error::InvalidModel(format!(
                        "tunnel address {} assigned twice",
                        addr
                    )));
                }
            }
            for subnet in &peer.subnets {
                match (subnet.nat, subnet.translated) {
                    (false, Some(_)) => {
                        return Err(Error::InvalidModel(format!(
                            "subnet {} of {} has a translation without NAT",
                            subnet.cidr, peer.name
                        )))
                    }
                    (true, Some(range)) => {
                        if translated.iter().any(|t| cidr::overlaps(t, &range)) {
                            return Err(Error::InvalidModel(format!(
                                "translated range {} is not unique",
                                range
                            )));
                        }
                        translated.push(range);
                    }
                    _ => {}
                }
            }
        }

        let mut shared = HashSet::new();
        for service in self.services.iter().filter(|s| s.active) {
            if !self.peers.iter().any(|p| p.id == service.peer_id) {
                return Err(Error::InvalidModel(format!(
                    "service {} references unknown peer {}",
                    service.name, service.peer_id
                )));
            }
            if let Some(addr) = service.shared_address {
                if !self.wan.shared_range.contains(&addr) {
                    return Err(Error::InvalidModel(format!(
                        "service {}: shared address {} outside {}",
                        service.name, addr, self.wan.shared_range
                    )));
                }
                if !shared.insert(addr) {
                    return Err(Error::InvalidModel(format!(
                        "shared address {} assigned twice",
                        addr
                    )));
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_wan_rejects_overlapping_pools() {
        let mut wan = wan(TopologyMode::Mesh);
        assert!(wan.validate().is_ok());
        wan.shared_range = "10.0.0.128/25".parse().unwrap();
        assert!(wan.validate().is_err());
    }

    #[test]
    fn test_interface_name_derived_from_wan() {
        let wan = wan(TopologyMode::Mesh);
        assert_eq!(wan.interface_name(), "wg-corp-wan");

        let mut odd = wan.clone();
        odd.name = "***".to_string();
        assert!(odd.interface_name().starts_with("wg-"));
        assert_eq!(odd.interface_name().len(), 11);
    }

    #[test]
    fn test_endpoint_parts() {
        let mut p = peer(1, "a", DeviceType::ManagedRouter, "10.0.0.1");
        p.endpoint = Some("203.0.113.7:13231".to_string());
        assert_eq!(p.endpoint_parts(), Some(("203.0.113.7".to_string(), 13231)));

        p.endpoint = Some("vpn.example.net".to_string());
        assert_eq!(
            p.endpoint_parts(),
            Some(("vpn.example.net".to_string(), DEFAULT_LISTEN_PORT))
        );

        p.endpoint = None;
        assert_eq!(p.endpoint_parts(), None);
    }

    #[test]
    fn test_active_requires_key_and_address() {
        let mut p = peer(1, "a", DeviceType::Server, "10.0.0.1");
        assert!(p.is_active());
        p.public_key = None;
        assert!(!p.is_active());
        p.public_key = Some("k".into());
        p.tunnel_address = None;
        assert!(!p.is_active());
    }

    #[test]
    fn test_advertised_uses_translation_only_with_nat() {
        let mut s = subnet(1, "192.168.1.0/24", true);
        s.translated = Some("172.16.5.0/24".parse().unwrap());
        assert_eq!(s.advertised().to_string(), "192.168.1.0/24");
        s.nat = true;
        assert_eq!(s.advertised().to_string(), "172.16.5.0/24");
    }

    #[test]
    fn test_model_validation_catches_duplicates() {
        let a = peer(1, "a", DeviceType::ManagedRouter, "10.0.0.1");
        let b = peer(2, "b", DeviceType::ManagedRouter, "10.0.0.1");
        let model = OverlayModel {
            wan: wan(TopologyMode::Mesh),
            peers: vec![a.clone(), b],
            services: vec![],
        };
        assert!(model.validate().is_err());

        let mut outside = a.clone();
        outside.tunnel_address = Some("10.9.9.9".parse().unwrap());
        let model = OverlayModel {
            wan: wan(TopologyMode::Mesh),
            peers: vec![outside],
            services: vec![],
        };
        assert!(model.validate().is_err());

        let model = OverlayModel {
            wan: wan(TopologyMode::Mesh),
            peers: vec![a.clone()],
            services: vec![
                service(10, &a, "192.168.1.10", 80, "10.0.5.1"),
                service(11, &a, "192.168.1.11", 80, "10.0.5.1"),
            ],
        };
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_peer_of_another_wan_is_rejected() {
        let mut stray = peer(1, "stray", DeviceType::ManagedRouter, "10.0.0.1");
        stray.wan_id = Uuid::from_u128(0xB);
        let model = OverlayModel {
            wan: wan(TopologyMode::Mesh),
            peers: vec![stray],
            services: vec![],
        };
        assert!(matches!(
            model.validate(),
            Err(Error::WanNotFound(id)) if id == Uuid::from_u128(0xB)
        ));
    }

    #[test]
    fn test_find_peer_by_name_or_id() {
        let a = peer(1, "a", DeviceType::ManagedRouter, "10.0.0.1");
        let model = OverlayModel {
            wan: wan(TopologyMode::Mesh),
            peers: vec![a.clone()],
            services: vec![],
        };
        assert_eq!(model.find_peer("a").map(|p| p.id), Some(a.id));
        assert_eq!(
            model.find_peer(&a.id.to_string()).map(|p| p.id),
            Some(a.id)
        );
        assert!(model.find_peer("nope").is_none());
    }
}
