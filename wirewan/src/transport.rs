// Device transports

//! Low-level device transports
//!
//! A [`Transport`] sends one request to a device and returns the raw status and
//! JSON body. It does not interpret statuses; classification, timeouts and
//! retries live in [`crate::client`]. Only failures to get any answer at all are
//! reported as errors.
//!
//! Two implementations are provided: [`RestTransport`] speaks the RouterOS v7
//! REST API over HTTPS, and [`MemoryDevice`] is an in-process device used for
//! dry runs and tests.

use crate::descriptor::{field, Category, Record};
use crate::error::DeviceError;
use crate::model::ManagementAccess;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

/// Request methods used against the device API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// Read a collection
    Get,
    /// Create a record in a collection
    Post,
    /// Update a record by id
    Patch,
    /// Remove a record by id
    Delete,
}

impl Method {
    /// Anything but a read
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Raw device answer
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP status
    pub status: u16,
    /// Decoded JSON body
    pub body: Value,
}

impl Response {
    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Human-readable error text from a RouterOS error body
    pub fn error_detail(&self) -> String {
        let text = |key: &str| self.body.get(key).and_then(Value::as_str).map(str::to_string);
        match (text("message"), text("detail")) {
            (Some(message), Some(detail)) => format!("{}: {}", message, detail),
            (Some(message), None) => message,
            (None, Some(detail)) => detail,
            (None, None) => format!("HTTP {}", self.status),
        }
    }
}

/// `request(method, path, body) -> (status, body)` against one device
#[async_trait]
pub trait Transport: Send + Sync {
    /// One call; non-2xx answers are returned, not raised
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, DeviceError>;
}

/// Item path for a record in a collection (`/ip/route/*1A`)
pub fn item_path(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

/// RouterOS v7 REST API over HTTP(S)
pub struct RestTransport {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestTransport {
    /// Build a transport for a peer's management access
    ///
    /// `default_port` is used when the access record does not name a port.
    pub fn new(
        access: &ManagementAccess,
        default_port: u16,
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let scheme = if access.use_tls { "https" } else { "http" };
        let port = access.port.unwrap_or(default_port);
        let base_url = format!("{}://{}:{}/rest", scheme, access.host, port);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(access.use_tls && !access.verify_cert)
            .build()
            .map_err(|e| DeviceError::Connect(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            username: access.username.clone(),
            password: access.password.clone(),
        })
    }

    /// Build a transport against an explicit base URL (ending in `/rest`)
    pub fn with_base_url(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeviceError::Connect(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
        })
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, DeviceError> {
        let url = format!("{}{}", self.base_url, path);
        // RouterOS creates records with PUT on the collection
        let builder = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.put(&url),
            Method::Patch => self.client.patch(&url),
            Method::Delete => self.client.delete(&url),
        };
        let mut builder = builder.basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeviceError::Connect(format!("{} {} timed out", method, path))
            } else {
                DeviceError::Connect(format!("{} {}: {}", method, path, e))
            }
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| DeviceError::Connect(format!("Failed to read response: {}", e)))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(Response { status, body })
    }
}

#[derive(Debug)]
struct DeviceInner {
    collections: BTreeMap<String, Vec<Record>>,
    next_id: u64,
    identity: String,
    version: String,
    /// Mutation number (1-based) -> injected failure
    faults: HashMap<usize, (u16, String)>,
    mutations: usize,
    offline: bool,
    forced_status: Option<u16>,
    calls: Vec<(Method, String)>,
}

/// In-process RouterOS-like device
///
/// Records are kept per collection with generated `.id` values (`*1`, `*2`,
/// ...). Duplicate interface names, peer keys and addresses are rejected the
/// way RouterOS does. Failures can be injected per mutation for tests.
#[derive(Debug)]
pub struct MemoryDevice {
    inner: Mutex<DeviceInner>,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice {
    /// Empty RouterOS 7 device
    pub fn new() -> Self {
        Self::with_version("7.14.3 (stable)")
    }

    /// A device reporting the given RouterOS version
    pub fn with_version(version: &str) -> Self {
        let collections = Category::ALL
            .iter()
            .map(|c| (c.path().to_string(), Vec::new()))
            .collect();
        Self {
            inner: Mutex::new(DeviceInner {
                collections,
                next_id: 1,
                identity: "MikroTik".to_string(),
                version: version.to_string(),
                faults: HashMap::new(),
                mutations: 0,
                offline: false,
                forced_status: None,
                calls: Vec::new(),
            }),
        }
    }

    /// A device without the WireGuard menus (RouterOS 6)
    pub async fn without_wireguard(version: &str) -> Self {
        let device = Self::with_version(version);
        {
            let mut inner = device.inner.lock().await;
            inner.collections.remove(Category::Interface.path());
            inner.collections.remove(Category::Peer.path());
        }
        device
    }

    /// Set the reported router identity
    pub async fn set_identity(&self, identity: &str) {
        self.inner.lock().await.identity = identity.to_string();
    }

    /// Add a record directly, bypassing the call log and fault injection
    pub async fn seed(&self, collection: &str, record: Value) -> String {
        let mut inner = self.inner.lock().await;
        let id = format!("*{:X}", inner.next_id);
        inner.next_id += 1;
        let mut record = match record {
            Value::Object(map) => map,
            _ => Record::new(),
        };
        record.insert(".id".to_string(), Value::String(id.clone()));
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record);
        id
    }

    /// Fail the `n`-th mutating call (1-based) with the given status
    pub async fn fail_mutation(&self, n: usize, status: u16, detail: &str) {
        self.inner
            .lock()
            .await
            .faults
            .insert(n, (status, detail.to_string()));
    }

    /// Drop every request as if the device were unreachable
    pub async fn set_offline(&self, offline: bool) {
        self.inner.lock().await.offline = offline;
    }

    /// Answer every request with this status (e.g. 401)
    pub async fn force_status(&self, status: Option<u16>) {
        self.inner.lock().await.forced_status = status;
    }

    /// Mark every WireGuard peer as having a recent handshake
    pub async fn set_handshakes(&self, last_handshake: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(peers) = inner.collections.get_mut(Category::Peer.path()) {
            for peer in peers.iter_mut() {
                peer.insert(
                    "last-handshake".to_string(),
                    Value::String(last_handshake.to_string()),
                );
            }
        }
    }

    /// Copy of a collection's records
    pub async fn records(&self, collection: &str) -> Vec<Record> {
        self.inner
            .lock()
            .await
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Every request received, in order
    pub async fn calls(&self) -> Vec<(Method, String)> {
        self.inner.lock().await.calls.clone()
    }

    /// Number of mutating requests received
    pub async fn mutation_count(&self) -> usize {
        self.inner.lock().await.mutations
    }
}

fn error_response(status: u16, message: &str, detail: &str) -> Response {
    Response {
        status,
        body: json!({ "error": status, "message": message, "detail": detail }),
    }
}

fn duplicate_of(category: Category, existing: &Record, new: &Record) -> Option<&'static str> {
    let same = |key: &str| field(existing, key).is_some() && field(existing, key) == field(new, key);
    match category {
        Category::Interface if same("name") => Some("already have interface with such name"),
        Category::Peer if same("public-key") && same("interface") => {
            Some("already have peer with such public key")
        }
        Category::Address if same("address") && same("interface") => Some("already have such address"),
        _ => None,
    }
}

impl DeviceInner {
    fn handle(&mut self, method: Method, path: &str, body: Option<Value>) -> Response {
        match (method, path) {
            (Method::Get, "/system/identity") => {
                return Response {
                    status: 200,
                    body: json!({ "name": self.identity }),
                }
            }
            (Method::Get, "/system/resource") => {
                return Response {
                    status: 200,
                    body: json!({ "version": self.version, "board-name": "CHR" }),
                }
            }
            _ => {}
        }

        let (collection, id) = match path.rsplit_once("/*") {
            Some((collection, id)) => (collection, Some(format!("*{}", id))),
            None => (path, None),
        };
        let next_id = self.next_id;
        let category = Category::ALL.into_iter().find(|c| c.path() == collection);
        let Some(records) = self.collections.get_mut(collection) else {
            return error_response(404, "Not Found", "no such command or directory");
        };

        match (method, id) {
            (Method::Get, None) => Response {
                status: 200,
                body: Value::Array(records.iter().cloned().map(Value::Object).collect()),
            },
            (Method::Post, None) => {
                let mut record = match body {
                    Some(Value::Object(map)) => map,
                    _ => return error_response(400, "Bad Request", "missing body"),
                };
                let duplicate = category
                    .and_then(|c| records.iter().find_map(|r| duplicate_of(c, r, &record)));
                if let Some(reason) = duplicate {
                    return error_response(400, "Bad Request", &format!("failure: {}", reason));
                }
                let id = format!("*{:X}", next_id);
                record.insert(".id".to_string(), Value::String(id));
                record.insert("disabled".to_string(), Value::String("false".into()));
                if category == Some(Category::Interface) {
                    record.insert("running".to_string(), Value::String("true".into()));
                }
                records.push(record.clone());
                self.next_id += 1;
                Response {
                    status: 201,
                    body: Value::Object(record),
                }
            }
            (Method::Patch, Some(id)) => {
                let Some(record) = records.iter_mut().find(|r| field(r, ".id").as_deref() == Some(id.as_str())) else {
                    return error_response(404, "Not Found", "no such item");
                };
                if let Some(Value::Object(changes)) = body {
                    for (key, value) in changes {
                        if value.as_str() == Some("") {
                            record.remove(&key);
                        } else {
                            record.insert(key, value);
                        }
                    }
                }
                Response {
                    status: 200,
                    body: Value::Object(record.clone()),
                }
            }
            (Method::Delete, Some(id)) => {
                let before = records.len();
                records.retain(|r| field(r, ".id").as_deref() != Some(id.as_str()));
                if records.len() == before {
                    error_response(404, "Not Found", "no such item")
                } else {
                    Response {
                        status: 204,
                        body: Value::Null,
                    }
                }
            }
            _ => error_response(400, "Bad Request", "unsupported request"),
        }
    }
}

#[async_trait]
impl Transport for MemoryDevice {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, DeviceError> {
        let mut inner = self.inner.lock().await;
        if inner.offline {
            return Err(DeviceError::Connect(format!(
                "{} {}: connection refused",
                method, path
            )));
        }
        inner.calls.push((method, path.to_string()));
        if let Some(status) = inner.forced_status {
            return Ok(error_response(status, "Forced", "injected status"));
        }
        if method.is_mutation() {
            inner.mutations += 1;
            let n = inner.mutations;
            if let Some((status, detail)) = inner.faults.remove(&n) {
                return Ok(error_response(status, "Injected", &detail));
            }
        }
        Ok(inner.handle(method, path, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_device_crud() {
        let device = MemoryDevice::new();
        let created = device
            .request(
                Method::Post,
                "/ip/route",
                Some(json!({ "dst-address": "192.168.2.0/24", "gateway": "wg0" })),
            )
            .await
            .unwrap();
        assert_eq!(created.status, 201);
        let id = created.body[".id"].as_str().unwrap().to_string();

        let updated = device
            .request(
                Method::Patch,
                &item_path("/ip/route", &id),
                Some(json!({ "gateway": "wg1" })),
            )
            .await
            .unwrap();
        assert!(updated.is_success());
        assert_eq!(updated.body["gateway"], "wg1");

        let listed = device.request(Method::Get, "/ip/route", None).await.unwrap();
        assert_eq!(listed.body.as_array().unwrap().len(), 1);

        let deleted = device
            .request(Method::Delete, &item_path("/ip/route", &id), None)
            .await
            .unwrap();
        assert_eq!(deleted.status, 204);

        let missing = device
            .request(Method::Delete, &item_path("/ip/route", &id), None)
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn test_memory_device_rejects_duplicates() {
        let device = MemoryDevice::new();
        let body = json!({ "address": "10.0.0.1/24", "interface": "wg0" });
        let first = device
            .request(Method::Post, "/ip/address", Some(body.clone()))
            .await
            .unwrap();
        assert!(first.is_success());
        let second = device
            .request(Method::Post, "/ip/address", Some(body))
            .await
            .unwrap();
        assert_eq!(second.status, 400);
        assert!(second.error_detail().contains("already have such address"));
    }

    #[tokio::test]
    async fn test_fault_injection_counts_mutations_only() {
        let device = MemoryDevice::new();
        device.fail_mutation(2, 500, "boom").await;

        let body = json!({ "dst-address": "10.1.0.0/16", "gateway": "wg0" });
        device.request(Method::Get, "/ip/route", None).await.unwrap();
        let first = device
            .request(Method::Post, "/ip/route", Some(body.clone()))
            .await
            .unwrap();
        assert!(first.is_success());
        let second = device
            .request(Method::Post, "/ip/route", Some(body))
            .await
            .unwrap();
        assert_eq!(second.status, 500);
        assert_eq!(device.mutation_count().await, 2);
        assert_eq!(device.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_memory_device_serves_every_category() {
        let device = MemoryDevice::new();
        for category in Category::ALL {
            let response = device.request(Method::Get, category.path(), None).await.unwrap();
            assert_eq!(response.status, 200, "{}", category);
            assert_eq!(response.body, json!([]));
        }
    }

    #[tokio::test]
    async fn test_missing_menu_and_offline() {
        let device = MemoryDevice::without_wireguard("6.49.10").await;
        let response = device
            .request(Method::Get, "/interface/wireguard", None)
            .await
            .unwrap();
        assert_eq!(response.status, 404);

        device.set_offline(true).await;
        let err = device
            .request(Method::Get, "/ip/route", None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_detail() {
        let response = error_response(400, "Bad Request", "failure: already have such address");
        assert_eq!(
            response.error_detail(),
            "Bad Request: failure: already have such address"
        );
        let bare = Response {
            status: 502,
            body: Value::Null,
        };
        assert_eq!(bare.error_detail(), "HTTP 502");
    }
}
