// Error taxonomy

//! Typed errors for the reconciliation engine
//!
//! [`DeviceError`] classifies everything that can go wrong while talking to a
//! router. [`Error`] is the crate-level error returned by planning, model and
//! executor entry points; device failures that happen inside a running job are
//! recorded on the job instead of being returned.

use std::net::Ipv4Addr;
use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by (or while reaching) a managed device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Device unreachable, timed out, or answered with a server error
    #[error("Connection error: {0}")]
    Connect(String),

    /// Credentials rejected by the device
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The device reports a resource that already exists or vanished underneath us
    #[error("Conflict on {resource}: {detail}")]
    Conflict {
        /// REST path of the resource
        resource: String,
        /// Device message
        detail: String,
    },

    /// The device rejected a descriptor value
    #[error("Validation error: {0}")]
    Validation(String),

    /// The device lacks a required capability
    #[error("Unsupported device: {detail} ({hint})")]
    Version {
        /// What is missing
        detail: String,
        /// What the operator can do about it
        hint: String,
    },

    /// Post-deploy checks did not pass
    #[error("Verification failed: {0}")]
    VerificationFailed(String),
}

impl DeviceError {
    /// Only transient connectivity problems are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeviceError::Connect(_))
    }
}

/// Engine errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Device failure surfaced outside a job
    #[error(transparent)]
    Device(#[from] DeviceError),

    // Allocation errors
    /// Every address in a pool is taken
    #[error("Address pool {pool} is exhausted")]
    Exhausted {
        /// Pool CIDR
        pool: String,
    },

    /// A requested address cannot be reserved
    #[error("Address {address} cannot be reserved in {pool}: {reason}")]
    Unavailable {
        /// Requested address
        address: Ipv4Addr,
        /// Pool CIDR
        pool: String,
        /// Outside the pool, reserved, or taken
        reason: String,
    },

    /// Translation space has no free block of the needed size
    #[error("No free /{prefix_len} block left for NAT translation")]
    NoSpace {
        /// Prefix length of the subnet being translated
        prefix_len: u8,
    },

    // Model errors
    /// A CIDR string did not parse
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    /// The overlay model breaks an invariant
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// A peer references a WAN that is not loaded
    #[error("WAN network not found: {0}")]
    WanNotFound(Uuid),

    /// No peer matches a name or id
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Device operations need a managed router
    #[error("Peer {0} is not a managed router")]
    NotManaged(Uuid),

    /// Managed router without API credentials
    #[error("Peer {0} has no management access configured")]
    MissingCredentials(Uuid),

    /// Critical subnet conflicts stop deployment
    #[error("Peer {peer} has {count} unresolved critical subnet conflict(s)")]
    Blocked {
        /// Peer name
        peer: String,
        /// Blocking conflicts
        count: usize,
    },

    // Job errors
    /// Rollback without a recorded snapshot
    #[error("No prior deployment snapshot for peer {0}")]
    NoPriorState(Uuid),

    /// Another unfinished job holds the device
    #[error("Peer {peer} already has job {job} in flight")]
    DeviceBusy {
        /// Device
        peer: Uuid,
        /// Job holding it
        job: Uuid,
    },

    /// No job with this id
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Lifecycle move not allowed from the current status
    #[error("Job {job}: invalid transition from status {status:?}")]
    InvalidTransition {
        /// Job
        job: Uuid,
        /// Status it was in
        status: JobStatus,
    },

    // Collaborator errors
    /// Persistence failure
    #[error("Store error: {0}")]
    Store(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connect_errors_are_retryable() {
        assert!(DeviceError::Connect("reset".into()).is_retryable());
        assert!(!DeviceError::Auth("bad password".into()).is_retryable());
        assert!(!DeviceError::Validation("bad value".into()).is_retryable());
        assert!(!DeviceError::Conflict {
            resource: "/ip/route".into(),
            detail: "already exists".into()
        }
        .is_retryable());
        assert!(!DeviceError::Version {
            detail: "6.49".into(),
            hint: "upgrade".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_device_error_converts_into_engine_error() {
        let err: Error = DeviceError::Auth("denied".into()).into();
        assert!(matches!(err, Error::Device(DeviceError::Auth(_))));
        assert_eq!(err.to_string(), "Authentication failed: denied");
    }
}
