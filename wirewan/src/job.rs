// Deployment jobs

//! Deployment job records and their state machine
//!
//! ```text
//! pending ──> running ──> completed
//!    │           ├──────> failed ──(retry)──> new pending job
//!    └───────────┴──────> cancelled
//! ```
//!
//! Terminal jobs never change again. Every device call a job makes is appended
//! to its operation log, whatever the outcome.

use crate::descriptor::DeviceState;
use crate::transport::Method;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a job does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Push the compiled configuration
    Deploy,
    /// Restore the pre-deploy snapshot
    Rollback,
    /// Read-only drift check
    Verify,
    /// Management API reachability check
    TestConnection,
}

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a device slot
    Pending,
    /// Talking to the device
    Running,
    /// Finished without error
    Completed,
    /// Stopped on an error
    Failed,
    /// Stopped on request
    Cancelled,
}

impl JobStatus {
    /// Completed, failed and cancelled jobs never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Result of post-deploy verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationOutcome {
    /// Interface present and handshake check passed
    Passed,
    /// Configuration applied, but a check was inconclusive
    Warnings,
}

/// Outcome of one logged operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum Outcome {
    /// Device call accepted
    Success {
        /// HTTP status of the last attempt
        status: u16,
        /// Attempts made, retries included
        attempts: u32,
    },
    /// Device call failed for good
    Failure {
        /// Error text as reported to the user
        error: String,
    },
    /// Post-deploy checks
    Verification {
        /// Overall result
        outcome: VerificationOutcome,
        /// Inconclusive checks, empty when passed
        notes: Vec<String>,
    },
}

/// One entry of a job's operation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// HTTP verb used
    pub method: Method,
    /// REST path called
    pub path: String,
    /// What the call was meant to do, e.g. `create route 192.168.2.0/24`
    pub summary: String,
    /// How the call ended
    pub outcome: Outcome,
    /// When the call ended
    pub at: DateTime<Utc>,
}

impl OperationRecord {
    /// Entry stamped with the current time
    pub fn new(method: Method, path: impl Into<String>, summary: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            method,
            path: path.into(),
            summary: summary.into(),
            outcome,
            at: Utc::now(),
        }
    }

    /// Anything but a failure
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, Outcome::Failure { .. })
    }
}

/// One asynchronous attempt to act on a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentJob {
    /// Job identifier
    pub id: Uuid,
    /// Device the job acts on
    pub peer_id: Uuid,
    /// What the job does
    pub kind: JobKind,
    /// Lifecycle state
    pub status: JobStatus,
    /// Completed planned calls / planned calls
    pub progress: f64,
    /// Number of device mutations planned when the job started
    pub planned: usize,
    /// Every device call made, in order
    pub operations: Vec<OperationRecord>,
    /// Owned device state captured before the first mutation
    pub snapshot: Option<DeviceState>,
    /// Why the job failed, or a verification warning
    pub error: Option<String>,
    /// Post-deploy verification result
    pub verification: Option<VerificationOutcome>,
    /// Job this one retries
    pub retry_of: Option<Uuid>,
    /// When the job was queued
    pub created_at: DateTime<Utc>,
    /// When the job entered `running`
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentJob {
    /// Pending job for a peer
    pub fn new(peer_id: Uuid, kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_id,
            kind,
            status: JobStatus::Pending,
            progress: 0.0,
            planned: 0,
            operations: Vec::new(),
            snapshot: None,
            error: None,
            verification: None,
            retry_of: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, enforcing the lifecycle
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        );
        if !allowed {
            return Err(Error::InvalidTransition {
                job: self.id,
                status: self.status,
            });
        }

        log::debug!("Job {}: {:?} -> {:?}", self.id, self.status, next);
        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            status if status.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Enter `running` with the number of planned mutations
    pub fn start(&mut self, planned: usize) -> Result<()> {
        self.transition(JobStatus::Running)?;
        self.plan(planned);
        Ok(())
    }

    /// Set the number of planned mutations once the diff is known
    pub fn plan(&mut self, planned: usize) {
        self.planned = planned;
        self.progress = if planned == 0 { 1.0 } else { 0.0 };
    }

    /// Append a log entry; successful mutations advance progress
    pub fn record(&mut self, op: OperationRecord) {
        let counts = op.method.is_mutation() && matches!(op.outcome, Outcome::Success { .. });
        self.operations.push(op);
        if counts && self.planned > 0 {
            let done = self
                .operations
                .iter()
                .filter(|o| o.method.is_mutation() && matches!(o.outcome, Outcome::Success { .. }))
                .count();
            self.progress = (done as f64 / self.planned as f64).min(1.0);
        }
    }

    /// Enter `completed`
    pub fn complete(&mut self, verification: Option<VerificationOutcome>) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        self.verification = verification;
        self.progress = 1.0;
        Ok(())
    }

    /// Enter `failed` with the error text
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Enter `cancelled`
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(JobStatus::Cancelled)?;
        self.error = Some("cancelled".to_string());
        Ok(())
    }

    /// A fresh pending job repeating a failed one
    pub fn retry(&self) -> Result<DeploymentJob> {
        if self.status != JobStatus::Failed {
            return Err(Error::InvalidTransition {
                job: self.id,
                status: self.status,
            });
        }
        let mut job = DeploymentJob::new(self.peer_id, self.kind);
        job.retry_of = Some(self.id);
        Ok(job)
    }

    /// Most recent sign of life: queueing, start, or the last logged call
    pub fn last_activity(&self) -> DateTime<Utc> {
        [Some(self.created_at), self.started_at, self.operations.last().map(|o| o.at)]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at)
    }

    /// Number of device mutations actually attempted
    pub fn mutations_attempted(&self) -> usize {
        self.operations
            .iter()
            .filter(|o| o.method.is_mutation())
            .count()
    }
}
