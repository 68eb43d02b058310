// Post-deploy verification

//! Post-deploy verification and drift reporting
//!
//! After a deployment applies cleanly the interface and peers are read back.
//! The job passes when the interface is present and running and, if the device
//! showed handshakes before the deployment, at least one peer shows one again.
//! Anything inconclusive downgrades the outcome to warnings; configuration was
//! applied either way, so verification never fails a job.

use crate::client::DeviceClient;
use crate::descriptor::{Category, DeviceState, InterfaceDescriptor, PeerDescriptor, Resource};
use crate::diff::{diff, Change, Diff};
use crate::error::DeviceError;
use crate::job::VerificationOutcome;
use serde::Serialize;

/// Verification outcome plus the notes explaining it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Passed, or applied with warnings
    pub outcome: VerificationOutcome,
    /// Why the outcome is not `Passed`
    pub notes: Vec<String>,
}

impl Verification {
    /// The failed checks as an error, if any check failed
    pub fn error(&self) -> Option<DeviceError> {
        match self.outcome {
            VerificationOutcome::Passed => None,
            VerificationOutcome::Warnings => {
                Some(DeviceError::VerificationFailed(self.notes.join("; ")))
            }
        }
    }
}

fn has_handshake(peers: &[PeerDescriptor]) -> bool {
    peers.iter().any(|p| p.last_handshake.is_some())
}

/// Judge read-back interface and peer state against the desired state
pub fn evaluate(
    desired: &DeviceState,
    snapshot: Option<&DeviceState>,
    interfaces: &[InterfaceDescriptor],
    peers: &[PeerDescriptor],
) -> Verification {
    let mut notes = Vec::new();

    for wanted in &desired.interfaces {
        match interfaces.iter().find(|i| i.name == wanted.name) {
            None => notes.push(format!("interface {} not found after deployment", wanted.name)),
            Some(found) if found.running == Some(false) => {
                notes.push(format!("interface {} is not running", wanted.name))
            }
            Some(_) => {}
        }
    }

    let handshakes_before = snapshot.map(|s| has_handshake(&s.peers)).unwrap_or(false);
    if handshakes_before && !has_handshake(peers) {
        notes.push("no peer has completed a handshake yet".to_string());
    }

    let outcome = if notes.is_empty() {
        VerificationOutcome::Passed
    } else {
        VerificationOutcome::Warnings
    };
    Verification { outcome, notes }
}

/// Read interface and peers back and evaluate them
pub async fn verify_deployment(
    client: &DeviceClient,
    desired: &DeviceState,
    snapshot: Option<&DeviceState>,
) -> Verification {
    let read = async {
        let interfaces = client.list(Category::Interface).await?;
        let peers = client.list(Category::Peer).await?;
        Ok::<_, DeviceError>((interfaces, peers))
    };

    match read.await {
        Ok((interfaces, peers)) => {
            let interfaces: Vec<InterfaceDescriptor> =
                interfaces.iter().filter_map(InterfaceDescriptor::from_record).collect();
            let peers: Vec<PeerDescriptor> =
                peers.iter().filter_map(PeerDescriptor::from_record).collect();
            evaluate(desired, snapshot, &interfaces, &peers)
        }
        Err(e) => {
            log::warn!("Verification read failed: {}", e);
            Verification {
                outcome: VerificationOutcome::Warnings,
                notes: vec![format!("verification read failed: {}", e)],
            }
        }
    }
}

/// Difference between the model and what is on the device
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Nothing to create, update or delete
    pub in_sync: bool,
    /// One line per drifted resource
    pub issues: Vec<String>,
    /// Changes a deployment would make
    pub diff: Diff,
}

impl DriftReport {
    /// Compare `current` device state with `desired`
    pub fn new(desired: &DeviceState, current: &DeviceState) -> Self {
        let diff = diff(desired, current);
        let issues = diff.changes.iter().map(describe).collect();
        Self {
            in_sync: diff.is_empty(),
            issues,
            diff,
        }
    }
}

fn describe(change: &Change) -> String {
    use crate::diff::Action;
    match change.action {
        Action::Create => format!("missing {} {}", change.category, change.identity),
        Action::Delete => format!("unexpected {} {}", change.category, change.identity),
        Action::Update => {
            let keys: Vec<&str> = change.fields.keys().map(String::as_str).collect();
            format!(
                "{} {} differs in {}",
                change.category,
                change.identity,
                keys.join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{OwnershipTag, RouteDescriptor};

    fn iface(running: Option<bool>) -> InterfaceDescriptor {
        InterfaceDescriptor {
            id: Some("*1".into()),
            name: "wg-corp".into(),
            listen_port: 51820,
            private_key: None,
            running,
            tag: OwnershipTag::new("iface-1"),
        }
    }

    fn peer(handshake: Option<&str>) -> PeerDescriptor {
        PeerDescriptor {
            id: Some("*2".into()),
            interface: "wg-corp".into(),
            public_key: "pk".into(),
            endpoint_address: None,
            endpoint_port: None,
            allowed_address: "10.0.0.2/32".into(),
            persistent_keepalive: None,
            last_handshake: handshake.map(str::to_string),
            tag: OwnershipTag::new("peer-2"),
        }
    }

    fn desired() -> DeviceState {
        DeviceState {
            interfaces: vec![iface(None)],
            ..Default::default()
        }
    }

    #[test]
    fn test_passes_when_interface_running() {
        let v = evaluate(&desired(), None, &[iface(Some(true))], &[peer(None)]);
        assert_eq!(v.outcome, VerificationOutcome::Passed);
        assert!(v.notes.is_empty());
        assert_eq!(v.error(), None);
    }

    #[test]
    fn test_missing_interface_is_warning() {
        let v = evaluate(&desired(), None, &[], &[]);
        assert_eq!(v.outcome, VerificationOutcome::Warnings);
        assert!(v.notes[0].contains("not found"));
        assert!(matches!(
            v.error(),
            Some(DeviceError::VerificationFailed(detail)) if detail.contains("wg-corp not found")
        ));
    }

    #[test]
    fn test_handshake_required_only_if_seen_before() {
        let before = DeviceState {
            peers: vec![peer(Some("1m3s"))],
            ..Default::default()
        };
        let v = evaluate(&desired(), Some(&before), &[iface(Some(true))], &[peer(None)]);
        assert_eq!(v.outcome, VerificationOutcome::Warnings);

        let v = evaluate(&desired(), Some(&before), &[iface(Some(true))], &[peer(Some("4s"))]);
        assert_eq!(v.outcome, VerificationOutcome::Passed);

        let v = evaluate(&desired(), Some(&DeviceState::default()), &[iface(Some(true))], &[peer(None)]);
        assert_eq!(v.outcome, VerificationOutcome::Passed);
    }

    #[test]
    fn test_drift_report() {
        let route = RouteDescriptor {
            id: None,
            dst_address: "192.168.2.0/24".parse().unwrap(),
            gateway: "wg-corp".into(),
            tag: OwnershipTag::new("route-2"),
        };
        let want = DeviceState {
            routes: vec![route.clone()],
            ..Default::default()
        };
        let report = DriftReport::new(&want, &DeviceState::default());
        assert!(!report.in_sync);
        assert_eq!(report.issues, vec!["missing route 192.168.2.0/24".to_string()]);

        let mut have = want.clone();
        have.routes[0].id = Some("*9".into());
        assert!(DriftReport::new(&want, &have).in_sync);
    }
}
