// Device state reader

//! Device state reader
//!
//! Reads every resource category from a device and keeps only the records
//! carrying the ownership tag. RouterOS REST has no comment filter, so the
//! filtering happens here.

use crate::client::{records, DeviceClient, VERSION_HINT};
use crate::descriptor::{field, Category, DeviceState, Record};
use crate::error::DeviceError;
use crate::job::{OperationRecord, Outcome};
use crate::transport::Method;
use std::collections::BTreeMap;

/// Read owned state, logging each query into `ops`
pub async fn read_recorded(
    client: &DeviceClient,
    ops: &mut Vec<OperationRecord>,
) -> Result<DeviceState, DeviceError> {
    let records = read_raw_recorded(client, ops).await?;
    let state = DeviceState::from_records(&records);
    log::debug!("Read {} owned resources", state.len());
    Ok(state)
}

/// Read owned state
pub async fn read(client: &DeviceClient) -> Result<DeviceState, DeviceError> {
    read_recorded(client, &mut Vec::new()).await
}

/// Every record of every category, owned or not
pub async fn read_raw(client: &DeviceClient) -> Result<BTreeMap<Category, Vec<Record>>, DeviceError> {
    read_raw_recorded(client, &mut Vec::new()).await
}

async fn read_raw_recorded(
    client: &DeviceClient,
    ops: &mut Vec<OperationRecord>,
) -> Result<BTreeMap<Category, Vec<Record>>, DeviceError> {
    let mut all = BTreeMap::new();
    for category in Category::ALL {
        let summary = format!("read {} resources", category);
        let records = get_recorded(client, category.path(), summary, ops).await?;
        all.insert(category, records);
    }
    Ok(all)
}

/// One GET, appended to `ops` whatever the outcome
async fn get_recorded(
    client: &DeviceClient,
    path: &str,
    summary: String,
    ops: &mut Vec<OperationRecord>,
) -> Result<Vec<Record>, DeviceError> {
    match client.call(Method::Get, path, None).await {
        Ok(result) => {
            ops.push(OperationRecord::new(
                Method::Get,
                path,
                summary,
                Outcome::Success {
                    status: result.response.status,
                    attempts: result.attempts,
                },
            ));
            Ok(records(result.response.body))
        }
        Err(e) => {
            ops.push(OperationRecord::new(
                Method::Get,
                path,
                summary,
                Outcome::Failure {
                    error: e.to_string(),
                },
            ));
            Err(e)
        }
    }
}

/// Identity and version reported by a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// `/system/identity` name
    pub identity: String,
    /// `/system/resource` version
    pub version: String,
}

/// Major version from a RouterOS version string (`7.14.3 (stable)` -> 7)
pub fn major_version(version: &str) -> Option<u32> {
    version
        .trim()
        .split(|c: char| c == '.' || c.is_whitespace())
        .next()?
        .parse()
        .ok()
}

/// Query identity and version; RouterOS before 7 lacks WireGuard
pub async fn test_connection(client: &DeviceClient) -> Result<ConnectionInfo, DeviceError> {
    test_connection_recorded(client, &mut Vec::new()).await
}

/// [`test_connection`], logging each query into `ops`
pub async fn test_connection_recorded(
    client: &DeviceClient,
    ops: &mut Vec<OperationRecord>,
) -> Result<ConnectionInfo, DeviceError> {
    let identity = get_recorded(client, "/system/identity", "read identity".into(), ops).await?;
    let resource = get_recorded(client, "/system/resource", "read version".into(), ops).await?;

    let first = |records: &[Record], key: &str| {
        records
            .first()
            .and_then(|r| field(r, key))
            .unwrap_or_else(|| "Unknown".to_string())
    };
    let info = ConnectionInfo {
        identity: first(&identity, "name"),
        version: first(&resource, "version"),
    };

    match major_version(&info.version) {
        Some(major) if major >= 7 => Ok(info),
        _ => Err(DeviceError::Version {
            detail: format!("{} runs RouterOS {}", info.identity, info.version),
            hint: VERSION_HINT.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CallPolicy;
    use crate::transport::MemoryDevice;
    use serde_json::json;
    use std::sync::Arc;

    fn client(device: Arc<MemoryDevice>) -> DeviceClient {
        DeviceClient::new(device, CallPolicy::default())
    }

    #[tokio::test]
    async fn test_read_filters_by_tag() {
        let device = Arc::new(MemoryDevice::new());
        device
            .seed(
                "/ip/route",
                json!({ "dst-address": "0.0.0.0/0", "gateway": "ether1" }),
            )
            .await;
        device
            .seed(
                "/ip/route",
                json!({
                    "dst-address": "192.168.2.0/24",
                    "gateway": "wg-corp",
                    "comment": "WAN-Overlay-Manager:route-1"
                }),
            )
            .await;
        device
            .seed(
                "/ip/firewall/filter",
                json!({ "chain": "input", "action": "drop", "comment": "defconf: drop all" }),
            )
            .await;

        let mut log = Vec::new();
        let state = read_recorded(&client(device.clone()), &mut log)
            .await
            .unwrap();
        assert_eq!(state.routes.len(), 1);
        assert_eq!(state.routes[0].id.as_deref(), Some("*2"));
        assert!(state.firewall.is_empty());
        assert_eq!(log.len(), 6);
        assert!(log.iter().all(|op| op.method == Method::Get));

        let raw = read_raw(&client(device)).await.unwrap();
        assert_eq!(raw[&Category::Route].len(), 2);
    }

    #[tokio::test]
    async fn test_read_without_wireguard_is_version_error() {
        let device = Arc::new(MemoryDevice::without_wireguard("6.49.10").await);
        let err = read(&client(device)).await.unwrap_err();
        assert!(matches!(err, DeviceError::Version { .. }));
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("7.14.3 (stable)"), Some(7));
        assert_eq!(major_version("6.49.10"), Some(6));
        assert_eq!(major_version("7"), Some(7));
        assert_eq!(major_version("Unknown"), None);
    }

    #[tokio::test]
    async fn test_connection_reports_identity() {
        let device = Arc::new(MemoryDevice::new());
        device.set_identity("branch-gw").await;
        let info = test_connection(&client(device)).await.unwrap();
        assert_eq!(info.identity, "branch-gw");
        assert!(info.version.starts_with("7."));
    }

    #[tokio::test]
    async fn test_connection_records_queries() {
        let device = Arc::new(MemoryDevice::with_version("6.48.6 (long-term)"));
        let mut ops = Vec::new();
        let result = test_connection_recorded(&client(device), &mut ops).await;
        assert!(result.is_err());
        // Both queries answered; the version check failed afterwards
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.is_success()));
    }

    #[tokio::test]
    async fn test_connection_rejects_routeros_6() {
        let device = Arc::new(MemoryDevice::with_version("6.48.6 (long-term)"));
        let err = test_connection(&client(device)).await.unwrap_err();
        match err {
            DeviceError::Version { hint, .. } => assert!(hint.contains("7.x")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_auth_failure() {
        let device = Arc::new(MemoryDevice::new());
        device.force_status(Some(401)).await;
        let err = test_connection(&client(device)).await.unwrap_err();
        assert!(matches!(err, DeviceError::Auth(_)));
    }
}
