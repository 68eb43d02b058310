// Diff engine

//! Set reconciliation between desired and current device state
//!
//! Descriptors are matched per category by identity key (interface name, peer
//! public key, address and interface, route destination, rule tag suffix).
//! Matched pairs that differ produce an update carrying only the changed
//! fields; unmatched current entries are deleted, unmatched desired entries are
//! created. Only tagged resources ever reach the diff, so nothing owned by the
//! device operator can be touched.

use crate::descriptor::{to_body, Category, DeviceState, Fields, OwnershipTag, Resource};
use crate::transport::{item_path, Method};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Kind of change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Remove a current record
    Delete,
    /// Add a desired record
    Create,
    /// Patch changed fields
    Update,
}

/// One entry of a diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    /// Resource category
    pub category: Category,
    /// What happens
    pub action: Action,
    /// Identity the records were matched on
    pub identity: String,
    /// Ownership marker
    pub tag: OwnershipTag,
    /// Device id of the matched current record (updates and deletes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Full field set for creates, changed fields for updates, empty for deletes
    pub fields: Fields,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        write!(f, "{} {} {}", action, self.category, self.identity)
    }
}

/// A device call derived from a change
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    /// HTTP verb
    pub method: Method,
    /// REST path
    pub path: String,
    /// JSON body for creates and updates
    pub body: Option<Value>,
    /// Human-readable description
    pub summary: String,
}

/// Create/update/delete sets across all categories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diff {
    /// Category order, and within a category: deletes, creates, updates
    pub changes: Vec<Change>,
}

impl Diff {
    /// Nothing to change
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    fn with_action(&self, action: Action) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |c| c.action == action)
    }

    /// Create entries
    pub fn creates(&self) -> impl Iterator<Item = &Change> {
        self.with_action(Action::Create)
    }

    /// Update entries
    pub fn updates(&self) -> impl Iterator<Item = &Change> {
        self.with_action(Action::Update)
    }

    /// Delete entries
    pub fn deletes(&self) -> impl Iterator<Item = &Change> {
        self.with_action(Action::Delete)
    }

    /// Changes of one category
    pub fn category(&self, category: Category) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |c| c.category == category)
    }

    /// Ordered device calls applying this diff
    ///
    /// Categories go interface, peers, addresses, routes, firewall, NAT so that
    /// anything referenced is created first. Interface deletions go last, after
    /// everything that could still reference the interface is gone.
    pub fn plan(&self) -> Vec<PlannedCall> {
        let (late, early): (Vec<&Change>, Vec<&Change>) = self
            .changes
            .iter()
            .partition(|c| c.category == Category::Interface && c.action == Action::Delete);

        early
            .into_iter()
            .chain(late)
            .filter_map(|change| {
                let collection = change.category.path();
                let summary = change.to_string();
                let call = match change.action {
                    Action::Create => PlannedCall {
                        method: Method::Post,
                        path: collection.to_string(),
                        body: Some(to_body(&change.fields)),
                        summary,
                    },
                    Action::Update | Action::Delete => {
                        let Some(id) = change.device_id.as_deref() else {
                            log::warn!("Skipping {}: no device id", summary);
                            return None;
                        };
                        let (method, body) = if change.action == Action::Update {
                            (Method::Patch, Some(to_body(&change.fields)))
                        } else {
                            (Method::Delete, None)
                        };
                        PlannedCall {
                            method,
                            path: item_path(collection, id),
                            body,
                            summary,
                        }
                    }
                };
                Some(call)
            })
            .collect()
    }
}

/// Fields of `desired` that differ from `current`
///
/// Fields set on the device but unset in `desired` are cleared with an empty
/// value, except those the category keeps when unset.
fn changed_fields<R: Resource>(desired: &R, current: &R) -> Fields {
    let want = desired.fields();
    let have = current.fields();
    let mut changed = Fields::new();

    for (key, value) in &want {
        if have.get(key) != Some(value) {
            changed.insert(key.clone(), value.clone());
        }
    }
    for key in have.keys() {
        if !want.contains_key(key) && !R::KEEP_WHEN_UNSET.contains(&key.as_str()) {
            changed.insert(key.clone(), String::new());
        }
    }
    changed
}

fn diff_category<R: Resource>(desired: &[R], current: &[R], out: &mut Vec<Change>) {
    let mut wanted: HashMap<String, &R> = HashMap::new();
    let mut desired_order = Vec::new();
    for d in desired {
        let identity = d.identity();
        if wanted.contains_key(&identity) {
            log::warn!("Duplicate desired {} {}, ignoring", R::CATEGORY, identity);
            continue;
        }
        wanted.insert(identity.clone(), d);
        desired_order.push(identity);
    }

    let mut matched: HashMap<String, &R> = HashMap::new();
    let mut deletes = Vec::new();
    let mut updates = Vec::new();

    for c in current {
        let identity = c.identity();
        // Keep the first owned record per identity; extra copies are removed
        if !wanted.contains_key(&identity) || matched.contains_key(&identity) {
            deletes.push(Change {
                category: R::CATEGORY,
                action: Action::Delete,
                identity,
                tag: c.tag().clone(),
                device_id: c.device_id().map(str::to_string),
                fields: Fields::new(),
            });
            continue;
        }
        matched.insert(identity, c);
    }

    let mut creates = Vec::new();
    for identity in desired_order {
        let Some(d) = wanted.get(&identity) else {
            continue;
        };
        match matched.get(&identity) {
            None => creates.push(Change {
                category: R::CATEGORY,
                action: Action::Create,
                identity,
                tag: d.tag().clone(),
                device_id: None,
                fields: d.fields(),
            }),
            Some(c) => {
                let fields = changed_fields(*d, *c);
                if !fields.is_empty() {
                    updates.push(Change {
                        category: R::CATEGORY,
                        action: Action::Update,
                        identity,
                        tag: d.tag().clone(),
                        device_id: c.device_id().map(str::to_string),
                        fields,
                    });
                }
            }
        }
    }

    out.extend(deletes);
    out.extend(creates);
    out.extend(updates);
}

/// Changes moving `current` to `desired`
pub fn diff(desired: &DeviceState, current: &DeviceState) -> Diff {
    let mut changes = Vec::new();
    diff_category(&desired.interfaces, &current.interfaces, &mut changes);
    diff_category(&desired.peers, &current.peers, &mut changes);
    diff_category(&desired.addresses, &current.addresses, &mut changes);
    diff_category(&desired.routes, &current.routes, &mut changes);
    diff_category(&desired.firewall, &current.firewall, &mut changes);
    diff_category(&desired.nat, &current.nat, &mut changes);
    Diff { changes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{
        FirewallRuleDescriptor, InterfaceDescriptor, PeerDescriptor, RouteDescriptor,
    };

    fn route(dst: &str, gateway: &str, tag: &str, id: Option<&str>) -> RouteDescriptor {
        RouteDescriptor {
            id: id.map(str::to_string),
            dst_address: dst.parse().unwrap(),
            gateway: gateway.to_string(),
            tag: OwnershipTag::new(tag),
        }
    }

    fn iface(name: &str, key: Option<&str>, id: Option<&str>) -> InterfaceDescriptor {
        InterfaceDescriptor {
            id: id.map(str::to_string),
            name: name.to_string(),
            listen_port: 51820,
            private_key: key.map(str::to_string),
            running: id.map(|_| true),
            tag: OwnershipTag::new("iface-1"),
        }
    }

    #[test]
    fn test_identical_states_produce_empty_diff() {
        let desired = DeviceState {
            interfaces: vec![iface("wg0", Some("k"), None)],
            routes: vec![route("192.168.2.0/24", "wg0", "route-2", None)],
            ..Default::default()
        };
        let current = DeviceState {
            interfaces: vec![iface("wg0", Some("k"), Some("*1"))],
            routes: vec![route("192.168.2.0/24", "wg0", "route-2", Some("*5"))],
            ..Default::default()
        };
        assert!(diff(&desired, &current).is_empty());
    }

    #[test]
    fn test_create_update_delete() {
        let desired = DeviceState {
            routes: vec![
                route("192.168.2.0/24", "wg1", "route-2", None),
                route("192.168.3.0/24", "wg1", "route-3", None),
            ],
            ..Default::default()
        };
        let current = DeviceState {
            routes: vec![
                route("192.168.2.0/24", "wg0", "route-2", Some("*1")),
                route("192.168.9.0/24", "wg0", "route-9", Some("*2")),
            ],
            ..Default::default()
        };
        let d = diff(&desired, &current);

        let actions: Vec<Action> = d.changes.iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![Action::Delete, Action::Create, Action::Update]);

        let update = d.updates().next().unwrap();
        assert_eq!(update.device_id.as_deref(), Some("*1"));
        // Only the changed field
        assert_eq!(update.fields.len(), 1);
        assert_eq!(update.fields["gateway"], "wg1");

        let delete = d.deletes().next().unwrap();
        assert_eq!(delete.identity, "192.168.9.0/24");
        assert_eq!(delete.device_id.as_deref(), Some("*2"));
    }

    #[test]
    fn test_unset_field_is_cleared_unless_kept() {
        let mut desired_peer = PeerDescriptor {
            id: None,
            interface: "wg0".into(),
            public_key: "pk".into(),
            endpoint_address: None,
            endpoint_port: None,
            allowed_address: "10.0.0.2/32".into(),
            persistent_keepalive: Some("25s".into()),
            last_handshake: None,
            tag: OwnershipTag::new("peer-2"),
        };
        let mut current_peer = desired_peer.clone();
        current_peer.id = Some("*3".into());
        current_peer.endpoint_address = Some("203.0.113.1".into());
        current_peer.last_handshake = Some("10s".into());

        let d = diff(
            &DeviceState {
                peers: vec![desired_peer.clone()],
                interfaces: vec![iface("wg0", None, None)],
                ..Default::default()
            },
            &DeviceState {
                peers: vec![current_peer],
                interfaces: vec![iface("wg0", Some("device-generated"), Some("*1"))],
                ..Default::default()
            },
        );
        // Private key is kept; the endpoint is cleared; handshake is ignored
        assert_eq!(d.len(), 1);
        let update = &d.changes[0];
        assert_eq!(update.category, Category::Peer);
        assert_eq!(update.fields.get("endpoint-address").map(String::as_str), Some(""));
        assert_eq!(update.fields.len(), 1);

        desired_peer.allowed_address = "10.0.0.2/32,10.0.5.0/24".into();
        assert_eq!(
            changed_fields(&desired_peer, &desired_peer.clone()).len(),
            0
        );
    }

    #[test]
    fn test_duplicate_current_records_are_removed() {
        let desired = DeviceState {
            routes: vec![route("192.168.2.0/24", "wg0", "route-2", None)],
            ..Default::default()
        };
        let current = DeviceState {
            routes: vec![
                route("192.168.2.0/24", "wg0", "route-2", Some("*1")),
                route("192.168.2.0/24", "wg0", "route-2", Some("*7")),
            ],
            ..Default::default()
        };
        let d = diff(&desired, &current);
        assert_eq!(d.len(), 1);
        assert_eq!(d.changes[0].action, Action::Delete);
        assert_eq!(d.changes[0].device_id.as_deref(), Some("*7"));
    }

    #[test]
    fn test_plan_orders_categories_and_defers_interface_delete() {
        let desired = DeviceState {
            interfaces: vec![iface("wg-new", Some("k"), None)],
            routes: vec![route("192.168.2.0/24", "wg-new", "route-2", None)],
            firewall: vec![FirewallRuleDescriptor {
                id: None,
                chain: "input".into(),
                action: "accept".into(),
                in_interface: Some("wg-new".into()),
                out_interface: None,
                tag: OwnershipTag::new("allow-input-wan-1"),
            }],
            ..Default::default()
        };
        let current = DeviceState {
            interfaces: vec![iface("wg-old", Some("k"), Some("*1"))],
            routes: vec![route("192.168.2.0/24", "wg-old", "route-2", Some("*2"))],
            ..Default::default()
        };
        let plan = diff(&desired, &current).plan();
        let calls: Vec<(Method, &str)> = plan.iter().map(|c| (c.method, c.path.as_str())).collect();
        assert_eq!(
            calls,
            vec![
                (Method::Post, "/interface/wireguard"),
                (Method::Patch, "/ip/route/*2"),
                (Method::Post, "/ip/firewall/filter"),
                (Method::Delete, "/interface/wireguard/*1"),
            ]
        );
        assert_eq!(plan[0].summary, "create interface wg-new");
        assert_eq!(
            plan[1].body,
            Some(serde_json::json!({ "gateway": "wg-new" }))
        );
    }
}
