// Device resource descriptors

//! Ownership tags and resource descriptors
//!
//! A device configuration is described by six resource categories, each with a
//! fixed field set and an explicit ownership tag. Desired state (compiled) and
//! current state (read from a device) share the same shape, so the diff engine
//! compares them structurally.
//!
//! Every descriptor renders to the RouterOS field names used on the wire
//! (`listen-port`, `allowed-address`, ...). Values are strings because that is
//! how the REST API reports them.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Namespace embedded in the comment of every resource this engine owns
pub const OWNERSHIP_NAMESPACE: &str = "WAN-Overlay-Manager";

/// A raw device record as returned by the REST API
pub type Record = Map<String, Value>;

/// Field name -> value, in RouterOS naming
pub type Fields = BTreeMap<String, String>;

/// Marks a device resource as created and owned by this engine
///
/// Rendered as `<namespace>:<suffix>` in the resource's `comment` field. The
/// suffix is derived from the model entity the resource comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnershipTag(String);

impl OwnershipTag {
    /// Tag with the given suffix
    pub fn new(suffix: impl Into<String>) -> Self {
        Self(suffix.into())
    }

    /// Suffix without the namespace
    pub fn suffix(&self) -> &str {
        &self.0
    }

    /// Comment value written to the device
    pub fn comment(&self) -> String {
        format!("{}:{}", OWNERSHIP_NAMESPACE, self.0)
    }

    /// Recover a tag from a comment; `None` for resources we do not own
    pub fn parse(comment: &str) -> Option<Self> {
        let suffix = comment
            .strip_prefix(OWNERSHIP_NAMESPACE)?
            .strip_prefix(':')?
            .trim();
        if suffix.is_empty() {
            None
        } else {
            Some(Self(suffix.to_string()))
        }
    }
}

impl fmt::Display for OwnershipTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.comment())
    }
}

/// Resource categories, in the order they are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// `/interface/wireguard`
    Interface,
    /// `/interface/wireguard/peers`
    Peer,
    /// `/ip/address`
    Address,
    /// `/ip/route`
    Route,
    /// `/ip/firewall/filter`
    Firewall,
    /// `/ip/firewall/nat`
    Nat,
}

impl Category {
    /// Every category in apply order
    pub const ALL: [Category; 6] = [
        Category::Interface,
        Category::Peer,
        Category::Address,
        Category::Route,
        Category::Firewall,
        Category::Nat,
    ];

    /// REST collection path
    pub fn path(&self) -> &'static str {
        match self {
            Category::Interface => "/interface/wireguard",
            Category::Peer => "/interface/wireguard/peers",
            Category::Address => "/ip/address",
            Category::Route => "/ip/route",
            Category::Firewall => "/ip/firewall/filter",
            Category::Nat => "/ip/firewall/nat",
        }
    }

    /// RouterOS console menu (used by script export)
    pub fn menu(&self) -> &'static str {
        match self {
            Category::Interface => "/interface wireguard",
            Category::Peer => "/interface wireguard peers",
            Category::Address => "/ip address",
            Category::Route => "/ip route",
            Category::Firewall => "/ip firewall filter",
            Category::Nat => "/ip firewall nat",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Interface => "interface",
            Category::Peer => "peer",
            Category::Address => "address",
            Category::Route => "route",
            Category::Firewall => "firewall",
            Category::Nat => "nat",
        };
        f.write_str(name)
    }
}

/// Behaviour shared by every descriptor variant
pub trait Resource: Sized + Clone {
    /// Category the resource lives in
    const CATEGORY: Category;

    /// Fields kept on the device when the desired descriptor leaves them unset
    const KEEP_WHEN_UNSET: &'static [&'static str] = &[];

    /// Ownership marker
    fn tag(&self) -> &OwnershipTag;

    /// Device-assigned `.id`, present only on records read from a device
    fn device_id(&self) -> Option<&str>;

    /// Stable key matching a desired descriptor with its device counterpart
    fn identity(&self) -> String;

    /// Managed fields (including `comment`), observed-only fields excluded
    fn fields(&self) -> Fields;

    /// Build from a device record; `None` when untagged or malformed
    fn from_record(record: &Record) -> Option<Self>;
}

/// JSON body for a create or update request
pub fn to_body(fields: &Fields) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Read a record field as a non-empty string
pub fn field(record: &Record, key: &str) -> Option<String> {
    let value = match record.get(key)? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn record_tag(record: &Record) -> Option<OwnershipTag> {
    OwnershipTag::parse(&field(record, "comment")?)
}

fn insert_opt(fields: &mut Fields, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        fields.insert(key.to_string(), v.clone());
    }
}

/// WireGuard interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// RouterOS `.id`, set on records read from the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Interface name
    pub name: String,
    /// UDP listen port
    pub listen_port: u16,
    /// Key material from the peer record; unmanaged when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Observed only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    /// Ownership marker
    pub tag: OwnershipTag,
}

impl Resource for InterfaceDescriptor {
    const CATEGORY: Category = Category::Interface;
    const KEEP_WHEN_UNSET: &'static [&'static str] = &["private-key"];

    fn tag(&self) -> &OwnershipTag {
        &self.tag
    }

    fn device_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn identity(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("name".into(), self.name.clone());
        fields.insert("listen-port".into(), self.listen_port.to_string());
        insert_opt(&mut fields, "private-key", &self.private_key);
        fields.insert("comment".into(), self.tag.comment());
        fields
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: field(record, ".id"),
            name: field(record, "name")?,
            listen_port: field(record, "listen-port")?.parse().ok()?,
            private_key: field(record, "private-key"),
            running: field(record, "running").map(|r| r == "true"),
            tag: record_tag(record)?,
        })
    }
}

/// A remote peer configured on the interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// RouterOS `.id`, set on records read from the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Interface the peer belongs to
    pub interface: String,
    /// Remote public key
    pub public_key: String,
    /// Remote host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_address: Option<String>,
    /// Remote UDP port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_port: Option<String>,
    /// Comma-separated CIDR list
    pub allowed_address: String,
    /// RouterOS duration, e.g. `25s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<String>,
    /// Observed only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handshake: Option<String>,
    /// Ownership marker
    pub tag: OwnershipTag,
}

impl PeerDescriptor {
    /// Entries of `allowed_address`
    pub fn allowed_networks(&self) -> impl Iterator<Item = &str> {
        self.allowed_address
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl Resource for PeerDescriptor {
    const CATEGORY: Category = Category::Peer;

    fn tag(&self) -> &OwnershipTag {
        &self.tag
    }

    fn device_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn identity(&self) -> String {
        self.public_key.clone()
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("interface".into(), self.interface.clone());
        fields.insert("public-key".into(), self.public_key.clone());
        insert_opt(&mut fields, "endpoint-address", &self.endpoint_address);
        insert_opt(&mut fields, "endpoint-port", &self.endpoint_port);
        fields.insert("allowed-address".into(), self.allowed_address.clone());
        insert_opt(&mut fields, "persistent-keepalive", &self.persistent_keepalive);
        fields.insert("comment".into(), self.tag.comment());
        fields
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: field(record, ".id"),
            interface: field(record, "interface")?,
            public_key: field(record, "public-key")?,
            endpoint_address: field(record, "endpoint-address"),
            endpoint_port: field(record, "endpoint-port"),
            allowed_address: field(record, "allowed-address").unwrap_or_default(),
            persistent_keepalive: field(record, "persistent-keepalive"),
            last_handshake: field(record, "last-handshake"),
            tag: record_tag(record)?,
        })
    }
}

/// IP address bound to the interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressDescriptor {
    /// RouterOS `.id`, set on records read from the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Address with prefix, e.g. `10.0.0.1/24`
    pub address: String,
    /// Interface the address is bound to
    pub interface: String,
    /// Ownership marker
    pub tag: OwnershipTag,
}

impl Resource for AddressDescriptor {
    const CATEGORY: Category = Category::Address;

    fn tag(&self) -> &OwnershipTag {
        &self.tag
    }

    fn device_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn identity(&self) -> String {
        format!("{}@{}", self.address, self.interface)
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("address".into(), self.address.clone());
        fields.insert("interface".into(), self.interface.clone());
        fields.insert("comment".into(), self.tag.comment());
        fields
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: field(record, ".id"),
            address: field(record, "address")?,
            interface: field(record, "interface")?,
            tag: record_tag(record)?,
        })
    }
}

/// Static route through the interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// RouterOS `.id`, set on records read from the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Destination network
    pub dst_address: Ipv4Net,
    /// Gateway interface
    pub gateway: String,
    /// Ownership marker
    pub tag: OwnershipTag,
}

impl Resource for RouteDescriptor {
    const CATEGORY: Category = Category::Route;

    fn tag(&self) -> &OwnershipTag {
        &self.tag
    }

    fn device_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn identity(&self) -> String {
        self.dst_address.to_string()
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("dst-address".into(), self.dst_address.to_string());
        fields.insert("gateway".into(), self.gateway.clone());
        fields.insert("comment".into(), self.tag.comment());
        fields
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: field(record, ".id"),
            dst_address: field(record, "dst-address")?.parse().ok()?,
            gateway: field(record, "gateway")?,
            tag: record_tag(record)?,
        })
    }
}

/// Firewall filter rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRuleDescriptor {
    /// RouterOS `.id`, set on records read from the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `input` or `forward`
    pub chain: String,
    /// Rule action, always `accept` here
    pub action: String,
    /// Matched inbound interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    /// Matched outbound interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    /// Ownership marker
    pub tag: OwnershipTag,
}

impl Resource for FirewallRuleDescriptor {
    const CATEGORY: Category = Category::Firewall;

    fn tag(&self) -> &OwnershipTag {
        &self.tag
    }

    fn device_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn identity(&self) -> String {
        self.tag.suffix().to_string()
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("chain".into(), self.chain.clone());
        fields.insert("action".into(), self.action.clone());
        insert_opt(&mut fields, "in-interface", &self.in_interface);
        insert_opt(&mut fields, "out-interface", &self.out_interface);
        fields.insert("comment".into(), self.tag.comment());
        fields
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: field(record, ".id"),
            chain: field(record, "chain")?,
            action: field(record, "action")?,
            in_interface: field(record, "in-interface"),
            out_interface: field(record, "out-interface"),
            tag: record_tag(record)?,
        })
    }
}

/// NAT rule (destination or source)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRuleDescriptor {
    /// RouterOS `.id`, set on records read from the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `dstnat` or `srcnat`
    pub chain: String,
    /// `dst-nat`, `src-nat` or `netmap`
    pub action: String,
    /// Matched protocol
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Matched source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_address: Option<String>,
    /// Matched destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_address: Option<String>,
    /// Matched destination port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<String>,
    /// Matched inbound interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    /// Matched outbound interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    /// Rewrite target address or range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_addresses: Option<String>,
    /// Rewrite target port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_ports: Option<String>,
    /// Ownership marker
    pub tag: OwnershipTag,
}

impl Resource for NatRuleDescriptor {
    const CATEGORY: Category = Category::Nat;

    fn tag(&self) -> &OwnershipTag {
        &self.tag
    }

    fn device_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn identity(&self) -> String {
        self.tag.suffix().to_string()
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("chain".into(), self.chain.clone());
        fields.insert("action".into(), self.action.clone());
        insert_opt(&mut fields, "protocol", &self.protocol);
        insert_opt(&mut fields, "src-address", &self.src_address);
        insert_opt(&mut fields, "dst-address", &self.dst_address);
        insert_opt(&mut fields, "dst-port", &self.dst_port);
        insert_opt(&mut fields, "in-interface", &self.in_interface);
        insert_opt(&mut fields, "out-interface", &self.out_interface);
        insert_opt(&mut fields, "to-addresses", &self.to_addresses);
        insert_opt(&mut fields, "to-ports", &self.to_ports);
        fields.insert("comment".into(), self.tag.comment());
        fields
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            id: field(record, ".id"),
            chain: field(record, "chain")?,
            action: field(record, "action")?,
            protocol: field(record, "protocol"),
            src_address: field(record, "src-address"),
            dst_address: field(record, "dst-address"),
            dst_port: field(record, "dst-port"),
            in_interface: field(record, "in-interface"),
            out_interface: field(record, "out-interface"),
            to_addresses: field(record, "to-addresses"),
            to_ports: field(record, "to-ports"),
            tag: record_tag(record)?,
        })
    }
}

/// One resource of any category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "kebab-case")]
pub enum Descriptor {
    /// WireGuard interface
    Interface(InterfaceDescriptor),
    /// WireGuard peer
    Peer(PeerDescriptor),
    /// Interface address
    Address(AddressDescriptor),
    /// Static route
    Route(RouteDescriptor),
    /// Firewall filter rule
    Firewall(FirewallRuleDescriptor),
    /// NAT rule
    Nat(NatRuleDescriptor),
}

impl Descriptor {
    /// Category of the wrapped resource
    pub fn category(&self) -> Category {
        match self {
            Descriptor::Interface(_) => Category::Interface,
            Descriptor::Peer(_) => Category::Peer,
            Descriptor::Address(_) => Category::Address,
            Descriptor::Route(_) => Category::Route,
            Descriptor::Firewall(_) => Category::Firewall,
            Descriptor::Nat(_) => Category::Nat,
        }
    }

    /// Ownership marker of the wrapped resource
    pub fn tag(&self) -> &OwnershipTag {
        match self {
            Descriptor::Interface(d) => d.tag(),
            Descriptor::Peer(d) => d.tag(),
            Descriptor::Address(d) => d.tag(),
            Descriptor::Route(d) => d.tag(),
            Descriptor::Firewall(d) => d.tag(),
            Descriptor::Nat(d) => d.tag(),
        }
    }

    /// Identity used to match desired and current records
    pub fn identity(&self) -> String {
        match self {
            Descriptor::Interface(d) => d.identity(),
            Descriptor::Peer(d) => d.identity(),
            Descriptor::Address(d) => d.identity(),
            Descriptor::Route(d) => d.identity(),
            Descriptor::Firewall(d) => d.identity(),
            Descriptor::Nat(d) => d.identity(),
        }
    }

    /// Device fields of the wrapped resource
    pub fn fields(&self) -> Fields {
        match self {
            Descriptor::Interface(d) => d.fields(),
            Descriptor::Peer(d) => d.fields(),
            Descriptor::Address(d) => d.fields(),
            Descriptor::Route(d) => d.fields(),
            Descriptor::Firewall(d) => d.fields(),
            Descriptor::Nat(d) => d.fields(),
        }
    }
}

/// Full configuration of one device, desired or observed
///
/// Vectors are kept in deterministic order by the compiler; the reader keeps
/// the device's order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// WireGuard interfaces
    #[serde(default)]
    pub interfaces: Vec<InterfaceDescriptor>,
    /// WireGuard peers
    #[serde(default)]
    pub peers: Vec<PeerDescriptor>,
    /// Interface addresses
    #[serde(default)]
    pub addresses: Vec<AddressDescriptor>,
    /// Static routes
    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,
    /// Firewall filter rules
    #[serde(default)]
    pub firewall: Vec<FirewallRuleDescriptor>,
    /// NAT rules
    #[serde(default)]
    pub nat: Vec<NatRuleDescriptor>,
}

impl DeviceState {
    /// No resources at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resource count over all categories
    pub fn len(&self) -> usize {
        self.interfaces.len()
            + self.peers.len()
            + self.addresses.len()
            + self.routes.len()
            + self.firewall.len()
            + self.nat.len()
    }

    /// All descriptors in apply order
    pub fn descriptors(&self) -> Vec<Descriptor> {
        let mut all = Vec::with_capacity(self.len());
        all.extend(self.interfaces.iter().cloned().map(Descriptor::Interface));
        all.extend(self.peers.iter().cloned().map(Descriptor::Peer));
        all.extend(self.addresses.iter().cloned().map(Descriptor::Address));
        all.extend(self.routes.iter().cloned().map(Descriptor::Route));
        all.extend(self.firewall.iter().cloned().map(Descriptor::Firewall));
        all.extend(self.nat.iter().cloned().map(Descriptor::Nat));
        all
    }

    /// Build from raw records, keeping only tagged, well-formed ones
    pub fn from_records(records: &BTreeMap<Category, Vec<Record>>) -> Self {
        fn parse<R: Resource>(records: &BTreeMap<Category, Vec<Record>>) -> Vec<R> {
            records
                .get(&R::CATEGORY)
                .map(|list| list.iter().filter_map(R::from_record).collect())
                .unwrap_or_default()
        }
        Self {
            interfaces: parse(records),
            peers: parse(records),
            addresses: parse(records),
            routes: parse(records),
            firewall: parse(records),
            nat: parse(records),
        }
    }
}
