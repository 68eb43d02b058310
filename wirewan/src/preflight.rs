// Preflight checks

//! Preflight checks against resources the engine does not own
//!
//! Before a first deployment the device is read unfiltered and the desired
//! state is checked against everything that does not carry the ownership tag:
//! an interface name or listen port already taken, identical addresses, routes
//! or rules, and routed subnets overlapping routes that already exist. Nothing
//! is written to the device.

use crate::client::DeviceClient;
use crate::conflict::{self, Conflict};
use crate::descriptor::{field, Category, DeviceState, Fields, OwnershipTag, Record, Resource};
use crate::error::DeviceError;
use crate::model::Peer;
use crate::reader;
use ipnet::Ipv4Net;
use serde::Serialize;
use std::collections::BTreeMap;

/// A desired resource colliding with an unmanaged one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Clash {
    /// Category of the desired resource
    pub category: Category,
    /// Identity of the desired resource
    pub resource: String,
    /// What it collides with
    pub detail: String,
}

impl Clash {
    /// As a device conflict error
    pub fn to_error(&self) -> DeviceError {
        DeviceError::Conflict {
            resource: format!("{} {}", self.category, self.resource),
            detail: self.detail.clone(),
        }
    }
}

/// Everything preflight found
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    /// Collisions with unmanaged resources
    pub clashes: Vec<Clash>,
    /// Routed subnets overlapping existing device routes
    pub route_conflicts: Vec<Conflict>,
}

impl PreflightReport {
    /// No clashes; route overlaps are only warnings
    pub fn is_clear(&self) -> bool {
        self.clashes.is_empty()
    }
}

fn unowned<'a>(raw: &'a BTreeMap<Category, Vec<Record>>, category: Category) -> Vec<&'a Record> {
    raw.get(&category)
        .map(|records| {
            records
                .iter()
                .filter(|r| {
                    field(r, "comment")
                        .and_then(|c| OwnershipTag::parse(&c))
                        .is_none()
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Whether `record` already carries every field of `desired` except the comment
fn same_resource(desired: &Fields, record: &Record) -> bool {
    desired
        .iter()
        .filter(|(key, _)| key.as_str() != "comment")
        .all(|(key, value)| field(record, key).as_deref() == Some(value.as_str()))
}

fn exact_duplicates<R: Resource>(desired: &[R], records: &[&Record], out: &mut Vec<Clash>) {
    for d in desired {
        let fields = d.fields();
        if records.iter().any(|r| same_resource(&fields, r)) {
            out.push(Clash {
                category: R::CATEGORY,
                resource: d.identity(),
                detail: "identical unmanaged resource already exists".to_string(),
            });
        }
    }
}

/// Check a desired state against an unfiltered device read
pub fn check(
    peer: &Peer,
    desired: &DeviceState,
    raw: &BTreeMap<Category, Vec<Record>>,
) -> PreflightReport {
    let mut clashes = Vec::new();

    let interfaces = unowned(raw, Category::Interface);
    for wanted in &desired.interfaces {
        for existing in &interfaces {
            let name = field(existing, "name").unwrap_or_default();
            if name == wanted.name {
                clashes.push(Clash {
                    category: Category::Interface,
                    resource: wanted.name.clone(),
                    detail: "interface name already in use".to_string(),
                });
            } else if field(existing, "listen-port") == Some(wanted.listen_port.to_string()) {
                clashes.push(Clash {
                    category: Category::Interface,
                    resource: wanted.name.clone(),
                    detail: format!("listen port {} used by {}", wanted.listen_port, name),
                });
            }
        }
    }

    let addresses = unowned(raw, Category::Address);
    for wanted in &desired.addresses {
        let ip = wanted.address.split('/').next().unwrap_or_default();
        let taken = addresses.iter().find_map(|r| {
            let existing = field(r, "address")?;
            (existing.split('/').next() == Some(ip)).then(|| field(r, "interface").unwrap_or_default())
        });
        if let Some(interface) = taken {
            clashes.push(Clash {
                category: Category::Address,
                resource: wanted.address.clone(),
                detail: format!("address already assigned to {}", interface),
            });
        }
    }

    let routes = unowned(raw, Category::Route);
    for wanted in &desired.routes {
        let dst = wanted.dst_address.to_string();
        if routes.iter().any(|r| field(r, "dst-address").as_deref() == Some(dst.as_str())) {
            clashes.push(Clash {
                category: Category::Route,
                resource: dst,
                detail: "route to this destination already exists".to_string(),
            });
        }
    }

    exact_duplicates(&desired.firewall, &unowned(raw, Category::Firewall), &mut clashes);
    exact_duplicates(&desired.nat, &unowned(raw, Category::Nat), &mut clashes);

    // Connected and dynamic routes belong to the router's own interfaces
    let static_routes: Vec<Ipv4Net> = routes
        .iter()
        .filter(|r| field(r, "connect").as_deref() != Some("true"))
        .filter(|r| field(r, "dynamic").as_deref() != Some("true"))
        .filter_map(|r| field(r, "dst-address")?.parse().ok())
        .filter(|dst| !peer.subnets.iter().any(|s| s.cidr == *dst))
        .collect();
    let route_conflicts = conflict::detect_existing_routes(peer, &static_routes);

    PreflightReport {
        clashes,
        route_conflicts,
    }
}

/// Read the device unfiltered and check `desired` against it
pub async fn preflight(
    client: &DeviceClient,
    peer: &Peer,
    desired: &DeviceState,
) -> Result<PreflightReport, DeviceError> {
    let raw = reader::read_raw(client).await?;
    let report = check(peer, desired, &raw);
    for clash in &report.clashes {
        log::warn!("Preflight: {} {}: {}", clash.category, clash.resource, clash.detail);
    }
    Ok(report)
}
