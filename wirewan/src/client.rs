// Device API client

//! Classified, retrying device API client
//!
//! Wraps a [`Transport`] with a per-call timeout, bounded retries with
//! exponential backoff for transient failures, and translation of HTTP
//! statuses into [`DeviceError`] kinds:
//!
//! | answer                                   | error        | retried |
//! |------------------------------------------|--------------|---------|
//! | no answer, timeout, 5xx                  | `Connect`    | yes     |
//! | 401, 403                                 | `Auth`       | no      |
//! | 409, 400 "already ...", 404 on an item   | `Conflict`   | no      |
//! | other 400, 422                           | `Validation` | no      |
//! | 404 on a collection                      | `Version`    | no      |

use crate::descriptor::{Category, Record};
use crate::error::DeviceError;
use crate::transport::{Method, Response, Transport};
use crate::types::DeployConfig;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Hint attached to capability errors
pub const VERSION_HINT: &str = "RouterOS 7.x with the REST API and WireGuard support is required";

/// Timeout, retry and backoff settings for device calls
#[derive(Debug, Clone)]
pub struct CallPolicy {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Extra attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry, doubled per attempt
    pub initial_backoff: Duration,
}

impl CallPolicy {
    /// Policy from the `[deploy]` section
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            timeout: config.call_timeout(),
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
        }
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_config(&DeployConfig::default())
    }
}

/// Successful call outcome
#[derive(Debug, Clone)]
pub struct CallResult {
    /// Final answer of the device
    pub response: Response,
    /// Attempts it took, starting at 1
    pub attempts: u32,
}

/// Map a device answer to success or a typed error
pub fn classify(method: Method, path: &str, response: Response) -> Result<Response, DeviceError> {
    if response.is_success() {
        return Ok(response);
    }
    let detail = response.error_detail();
    let conflict = || DeviceError::Conflict {
        resource: path.to_string(),
        detail: detail.clone(),
    };
    let err = match response.status {
        401 | 403 => DeviceError::Auth(detail.clone()),
        409 => conflict(),
        400 if detail.to_lowercase().contains("already") => conflict(),
        400 | 422 => DeviceError::Validation(format!("{} {}: {}", method, path, detail)),
        // An item vanished underneath us; a missing collection means a missing feature
        404 if path.contains("/*") => conflict(),
        404 => DeviceError::Version {
            detail: format!("{} is not available on this device", path),
            hint: VERSION_HINT.to_string(),
        },
        status if status >= 500 => {
            DeviceError::Connect(format!("{} {}: HTTP {}: {}", method, path, status, detail))
        }
        status => DeviceError::Validation(format!(
            "{} {}: unexpected HTTP {}: {}",
            method, path, status, detail
        )),
    };
    Err(err)
}

/// Device API client used by the reader and the executor
#[derive(Clone)]
pub struct DeviceClient {
    transport: Arc<dyn Transport>,
    policy: CallPolicy,
}

impl DeviceClient {
    /// Client over `transport`
    pub fn new(transport: Arc<dyn Transport>, policy: CallPolicy) -> Self {
        Self { transport, policy }
    }

    /// One logical call: timeout per attempt, retries for transient failures
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<CallResult, DeviceError> {
        let mut delay = self.policy.initial_backoff;
        let mut attempt = 1;

        loop {
            log::debug!("{} {} (attempt {})", method, path, attempt);
            let outcome = match tokio::time::timeout(
                self.policy.timeout,
                self.transport.request(method, path, body.clone()),
            )
            .await
            {
                Ok(Ok(response)) => classify(method, path, response),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(DeviceError::Connect(format!(
                    "{} {} timed out after {:?}",
                    method, path, self.policy.timeout
                ))),
            };

            match outcome {
                Ok(response) => {
                    return Ok(CallResult {
                        response,
                        attempts: attempt,
                    })
                }
                Err(e) if e.is_retryable() && attempt <= self.policy.max_retries => {
                    log::warn!(
                        "{} {} failed: {} (retrying in {:?}, attempt {}/{})",
                        method,
                        path,
                        e,
                        delay,
                        attempt,
                        self.policy.max_retries + 1
                    );
                    tokio::time::sleep(delay).await;
                    // Exponential backoff: double the delay for next attempt
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// All records of a category
    pub async fn list(&self, category: Category) -> Result<Vec<Record>, DeviceError> {
        let result = self.call(Method::Get, category.path(), None).await?;
        Ok(records(result.response.body))
    }

    /// A singleton menu such as `/system/resource`
    pub async fn get_object(&self, path: &str) -> Result<Record, DeviceError> {
        let result = self.call(Method::Get, path, None).await?;
        Ok(records(result.response.body)
            .into_iter()
            .next()
            .unwrap_or_default())
    }
}

/// Normalize a GET body (array or single object) into records
pub fn records(body: Value) -> Vec<Record> {
    match body {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Value::Object(map) => vec![map],
        _ => Vec::new(),
    }
}
