// Deployment executor

//! Deployment orchestration
//!
//! The executor turns caller requests into jobs:
//!
//! - `preview` compiles, reads and diffs without touching the device
//! - `deploy` either returns the diff for approval or starts a job applying it
//! - `rollback` starts a job driving the device back to the last snapshot
//! - `verify` and `test_connection` run to completion and return their job
//! - `cancel`, `retry` and `wait` act on existing jobs
//!
//! Each device has one execution slot: a second job for a device with a job
//! in flight is rejected with [`Error::DeviceBusy`]. Unfinished jobs found in
//! the store hold the device too, so executors sharing a job journal exclude
//! each other, until the job has shown no activity for `stale_job_secs`. Jobs for different devices
//! run in parallel up to `max_concurrent_deployments`; queued jobs stay
//! `pending` until a permit frees up. Device failures inside a job end up in
//! the job's log and status, never as an error returned to the caller.

use crate::client::{CallPolicy, DeviceClient};
use crate::compiler;
use crate::conflict;
use crate::descriptor::{Category, DeviceState};
use crate::diff::{diff, Diff};
use crate::job::{DeploymentJob, JobKind, JobStatus, OperationRecord, Outcome, VerificationOutcome};
use crate::model::{ApiStatus, OverlayModel, Peer};
use crate::preflight::{self, PreflightReport};
use crate::reader;
use crate::store::{ApiCheck, OverlayStore};
use crate::translation;
use crate::transport::{Method, RestTransport, Transport};
use crate::types::Config;
use crate::verify::{self, DriftReport, Verification};
use crate::{DeviceError, Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Semaphore};
use uuid::Uuid;

/// Opens an API client for a peer's device
#[async_trait]
pub trait Connector: Send + Sync {
    /// Client for `peer`'s device
    async fn connect(&self, peer: &Peer) -> Result<DeviceClient>;
}

/// Connects over the RouterOS REST API using the peer's management access
pub struct RestConnector {
    policy: CallPolicy,
    api_port: u16,
}

impl RestConnector {
    /// Connector using `api_port` when a peer sets none
    pub fn new(policy: CallPolicy, api_port: u16) -> Self {
        Self { policy, api_port }
    }
}

#[async_trait]
impl Connector for RestConnector {
    async fn connect(&self, peer: &Peer) -> Result<DeviceClient> {
        let access = peer
            .management
            .as_ref()
            .ok_or(Error::MissingCredentials(peer.id))?;
        let transport = RestTransport::new(access, self.api_port, self.policy.timeout)?;
        Ok(DeviceClient::new(Arc::new(transport), self.policy.clone()))
    }
}

/// Fixed peer -> transport table (in-memory devices, dry runs)
pub struct StaticConnector {
    policy: CallPolicy,
    devices: HashMap<Uuid, Arc<dyn Transport>>,
}

impl StaticConnector {
    /// Empty table
    pub fn new(policy: CallPolicy) -> Self {
        Self {
            policy,
            devices: HashMap::new(),
        }
    }

    /// Route `peer_id` to `transport`
    pub fn insert(&mut self, peer_id: Uuid, transport: Arc<dyn Transport>) {
        self.devices.insert(peer_id, transport);
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(&self, peer: &Peer) -> Result<DeviceClient> {
        let transport = self
            .devices
            .get(&peer.id)
            .ok_or(Error::MissingCredentials(peer.id))?;
        Ok(DeviceClient::new(transport.clone(), self.policy.clone()))
    }
}

/// Result of a deploy request
#[derive(Debug, Clone)]
pub enum DeployOutcome {
    /// Approval required; nothing was started
    NeedsApproval(Diff),
    /// Job started
    Started(Uuid),
}

/// Result of a verify request
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// The terminal verify job
    pub job: DeploymentJob,
    /// Absent when the device could not be read
    pub drift: Option<DriftReport>,
}

/// The job currently holding a device's execution slot
struct Slot {
    job_id: Uuid,
    cancel: Arc<AtomicBool>,
    status: watch::Sender<JobStatus>,
}

struct Inner {
    store: Arc<dyn OverlayStore>,
    connector: Arc<dyn Connector>,
    config: Config,
    permits: Semaphore,
    /// Peer id -> in-flight job
    slots: Mutex<HashMap<Uuid, Slot>>,
}

enum Applied {
    Done(Verification),
    Cancelled,
}

/// Deployment executor; cheap to clone
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// Executor over `store`, reaching devices through `connector`
    pub fn new(store: Arc<dyn OverlayStore>, connector: Arc<dyn Connector>, config: Config) -> Self {
        let permits = Semaphore::new(config.deploy.max_concurrent_deployments);
        Self {
            inner: Arc::new(Inner {
                store,
                connector,
                config,
                permits,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Model with every missing address and translation filled in
    async fn model(&self) -> Result<OverlayModel> {
        translation::materialize(&self.inner.store.model().await?)
    }

    /// A managed peer by id or name
    async fn managed_peer(&self, key: &str) -> Result<Peer> {
        let model = self.inner.store.model().await?;
        let peer = model
            .find_peer(key)
            .ok_or_else(|| Error::PeerNotFound(key.to_string()))?;
        if !peer.is_managed() {
            return Err(Error::NotManaged(peer.id));
        }
        Ok(peer.clone())
    }

    /// Compile the desired state of a managed peer
    ///
    /// Unresolved critical subnet conflicts stop here; deployment is not attempted.
    async fn compile(&self, key: &str) -> Result<(Peer, DeviceState)> {
        let model = self.model().await?;
        let peer = model
            .find_peer(key)
            .ok_or_else(|| Error::PeerNotFound(key.to_string()))?;
        if !peer.is_managed() {
            return Err(Error::NotManaged(peer.id));
        }

        let conflicts = conflict::detect(peer, &model);
        let blocking = conflict::blocking(&conflicts);
        if !blocking.is_empty() {
            for c in &blocking {
                log::warn!("{}", c.description);
            }
            return Err(Error::Blocked {
                peer: peer.name.clone(),
                count: blocking.len(),
            });
        }

        let desired = compiler::compile(
            peer,
            &model.wan,
            &model.peers,
            &model.services,
            &self.inner.config.defaults,
        )?;
        Ok((peer.clone(), desired))
    }

    /// Desired state of a peer's device, without contacting it
    pub async fn desired_state(&self, key: &str) -> Result<DeviceState> {
        Ok(self.compile(key).await?.1)
    }

    /// Diff the device would receive, without entering `running`
    pub async fn preview(&self, key: &str) -> Result<Diff> {
        let (peer, desired) = self.compile(key).await?;
        let client = self.inner.connector.connect(&peer).await?;
        let current = reader::read(&client).await?;
        Ok(diff(&desired, &current))
    }

    /// Clashes with unmanaged resources on the device
    pub async fn preflight(&self, key: &str) -> Result<PreflightReport> {
        let (peer, desired) = self.compile(key).await?;
        let client = self.inner.connector.connect(&peer).await?;
        Ok(preflight::preflight(&client, &peer, &desired).await?)
    }

    /// Deploy a peer's desired state
    ///
    /// Without `approve`, and when approval is required, only the diff is returned.
    pub async fn deploy(&self, key: &str, approve: bool) -> Result<DeployOutcome> {
        if !approve && self.inner.config.deploy.require_approval {
            return Ok(DeployOutcome::NeedsApproval(self.preview(key).await?));
        }
        let (peer, desired) = self.compile(key).await?;
        let job = DeploymentJob::new(peer.id, JobKind::Deploy);
        Ok(DeployOutcome::Started(self.launch(job, peer, desired).await?))
    }

    /// Deploy every auto-deploy managed router
    pub async fn deploy_all(&self, approve: bool) -> Result<Vec<(Peer, Result<DeployOutcome>)>> {
        let model = self.inner.store.model().await?;
        let targets: Vec<Peer> = model
            .peers
            .into_iter()
            .filter(|p| p.is_managed() && p.auto_deploy)
            .collect();
        log::info!("Deploying {} peer(s)", targets.len());

        let results: Vec<_> = stream::iter(targets)
            .map(|peer| async move {
                let outcome = self.deploy(&peer.id.to_string(), approve).await;
                (peer, outcome)
            })
            .buffer_unordered(self.inner.config.deploy.max_concurrent_deployments)
            .collect()
            .await;
        Ok(results)
    }

    /// Snapshot of the most recent completed or failed deployment
    async fn latest_snapshot(&self, peer: &Peer) -> Result<DeviceState> {
        self.inner
            .store
            .jobs_for_peer(peer.id)
            .await?
            .into_iter()
            .rev()
            .filter(|j| j.kind == JobKind::Deploy)
            .filter(|j| matches!(j.status, JobStatus::Completed | JobStatus::Failed))
            .find_map(|j| j.snapshot)
            .ok_or(Error::NoPriorState(peer.id))
    }

    /// Diff a rollback would apply
    pub async fn preview_rollback(&self, key: &str) -> Result<Diff> {
        let peer = self.managed_peer(key).await?;
        let snapshot = self.latest_snapshot(&peer).await?;
        let client = self.inner.connector.connect(&peer).await?;
        let current = reader::read(&client).await?;
        Ok(diff(&snapshot, &current))
    }

    /// Start a job driving the device back to the last deployment snapshot
    pub async fn rollback(&self, key: &str) -> Result<Uuid> {
        let peer = self.managed_peer(key).await?;
        let snapshot = self.latest_snapshot(&peer).await?;
        let job = DeploymentJob::new(peer.id, JobKind::Rollback);
        self.launch(job, peer, snapshot).await
    }

    /// Request cooperative cancellation of a pending or running job
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let slots = self.inner.slots.lock().await;
        if let Some(slot) = slots.values().find(|s| s.job_id == job_id) {
            log::info!("Cancelling job {}", job_id);
            slot.cancel.store(true, Ordering::SeqCst);
            return Ok(());
        }
        drop(slots);

        let job = self.inner.store.job(job_id).await?;
        Err(Error::InvalidTransition {
            job: job.id,
            status: job.status,
        })
    }

    /// Repeat a failed job as a new one
    pub async fn retry(&self, job_id: Uuid) -> Result<Uuid> {
        let failed = self.inner.store.job(job_id).await?;
        let job = failed.retry()?;
        let key = failed.peer_id.to_string();
        log::info!("Retrying {:?} job {} as {}", failed.kind, failed.id, job.id);

        match failed.kind {
            JobKind::Deploy => {
                let (peer, desired) = self.compile(&key).await?;
                self.launch(job, peer, desired).await
            }
            JobKind::Rollback => {
                let peer = self.managed_peer(&key).await?;
                let snapshot = self.latest_snapshot(&peer).await?;
                self.launch(job, peer, snapshot).await
            }
            JobKind::Verify => Ok(self.run_verify(job).await?.job.id),
            JobKind::TestConnection => Ok(self.run_test_connection(job).await?.id),
        }
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait(&self, job_id: Uuid) -> Result<DeploymentJob> {
        let rx = {
            let slots = self.inner.slots.lock().await;
            slots
                .values()
                .find(|s| s.job_id == job_id)
                .map(|s| s.status.subscribe())
        };
        if let Some(mut rx) = rx {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.inner.store.job(job_id).await
    }

    /// A job by id
    pub async fn job(&self, job_id: Uuid) -> Result<DeploymentJob> {
        self.inner.store.job(job_id).await
    }

    /// Jobs of a peer, oldest first
    pub async fn jobs_for_peer(&self, key: &str) -> Result<Vec<DeploymentJob>> {
        let model = self.inner.store.model().await?;
        let peer = model
            .find_peer(key)
            .ok_or_else(|| Error::PeerNotFound(key.to_string()))?;
        self.inner.store.jobs_for_peer(peer.id).await
    }

    /// Check connectivity and RouterOS version, updating the peer's API status
    pub async fn test_connection(&self, key: &str) -> Result<DeploymentJob> {
        let peer = self.managed_peer(key).await?;
        self.run_test_connection(DeploymentJob::new(peer.id, JobKind::TestConnection))
            .await
    }

    async fn run_test_connection(&self, mut job: DeploymentJob) -> Result<DeploymentJob> {
        let peer = self.managed_peer(&job.peer_id.to_string()).await?;
        let client = self.inner.connector.connect(&peer).await?;
        job.start(0)?;

        let mut ops = Vec::new();
        let result = reader::test_connection_recorded(&client, &mut ops).await;
        for op in ops {
            job.record(op);
        }

        let mut check = ApiCheck {
            status: ApiStatus::Connected,
            checked_at: Utc::now(),
            identity: None,
            version: None,
        };
        match result {
            Ok(info) => {
                log::info!("{}: connected to {} ({})", peer.name, info.identity, info.version);
                check.identity = Some(info.identity);
                check.version = Some(info.version);
                job.complete(None)?;
            }
            Err(e) => {
                log::warn!("{}: connection test failed: {}", peer.name, e);
                check.status = match e {
                    DeviceError::Auth(_) => ApiStatus::AuthFailed,
                    DeviceError::Connect(_) => ApiStatus::Unreachable,
                    _ => ApiStatus::Connected,
                };
                job.fail(e.to_string())?;
            }
        }

        self.inner.store.record_api_check(peer.id, check).await?;
        self.inner.store.save_job(&job).await?;
        Ok(job)
    }

    /// Compare the device against the model and record the result as a job
    pub async fn verify(&self, key: &str) -> Result<VerifyReport> {
        let peer = self.managed_peer(key).await?;
        self.run_verify(DeploymentJob::new(peer.id, JobKind::Verify))
            .await
    }

    async fn run_verify(&self, mut job: DeploymentJob) -> Result<VerifyReport> {
        let (peer, desired) = self.compile(&job.peer_id.to_string()).await?;
        let client = self.inner.connector.connect(&peer).await?;
        job.start(0)?;

        let mut ops = Vec::new();
        let result = reader::read_recorded(&client, &mut ops).await;
        for op in ops {
            job.record(op);
        }

        let drift = match result {
            Ok(current) => {
                let report = DriftReport::new(&desired, &current);
                let outcome = if report.in_sync {
                    VerificationOutcome::Passed
                } else {
                    VerificationOutcome::Warnings
                };
                log::info!(
                    "{}: {}",
                    peer.name,
                    if report.in_sync {
                        "in sync".to_string()
                    } else {
                        format!("{} drifted resource(s)", report.issues.len())
                    }
                );
                job.record(OperationRecord::new(
                    Method::Get,
                    Category::Interface.path(),
                    "compare with model",
                    Outcome::Verification {
                        outcome,
                        notes: report.issues.clone(),
                    },
                ));
                job.complete(Some(outcome))?;
                Some(report)
            }
            Err(e) => {
                log::warn!("{}: verify failed: {}", peer.name, e);
                job.fail(e.to_string())?;
                None
            }
        };

        self.inner.store.save_job(&job).await?;
        Ok(VerifyReport { job, drift })
    }

    /// Fail with `DeviceBusy` while another unfinished, non-stale job holds the device
    async fn ensure_idle(&self, peer: &Peer) -> Result<()> {
        if let Some(slot) = self.inner.slots.lock().await.get(&peer.id) {
            return Err(Error::DeviceBusy {
                peer: peer.id,
                job: slot.job_id,
            });
        }

        let stale_after = self.inner.config.deploy.stale_job_after();
        let now = Utc::now();
        for job in self.inner.store.jobs_for_peer(peer.id).await? {
            if job.status.is_terminal() {
                continue;
            }
            let idle = (now - job.last_activity()).to_std().unwrap_or_default();
            if idle < stale_after {
                return Err(Error::DeviceBusy {
                    peer: peer.id,
                    job: job.id,
                });
            }
            log::warn!(
                "{}: ignoring stale {:?} job {} ({:?}, idle {}s)",
                peer.name,
                job.kind,
                job.id,
                job.status,
                idle.as_secs()
            );
        }
        Ok(())
    }

    /// Claim the device slot, persist the job and run it in the background
    async fn launch(&self, job: DeploymentJob, peer: Peer, desired: DeviceState) -> Result<Uuid> {
        self.ensure_idle(&peer).await?;
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut slots = self.inner.slots.lock().await;
            if let Some(slot) = slots.get(&peer.id) {
                return Err(Error::DeviceBusy {
                    peer: peer.id,
                    job: slot.job_id,
                });
            }
            let (status, _) = watch::channel(job.status);
            slots.insert(
                peer.id,
                Slot {
                    job_id: job.id,
                    cancel: cancel.clone(),
                    status,
                },
            );
        }

        if let Err(e) = self.inner.store.save_job(&job).await {
            self.inner.slots.lock().await.remove(&peer.id);
            return Err(e);
        }

        let job_id = job.id;
        log::info!("{}: {:?} job {} queued", peer.name, job.kind, job_id);
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run(job, peer, desired, cancel).await;
        });
        Ok(job_id)
    }

    /// Save the job and publish its status
    async fn persist(&self, job: &DeploymentJob) {
        if let Err(e) = self.inner.store.save_job(job).await {
            log::error!("Failed to save job {}: {}", job.id, e);
        }
        let slots = self.inner.slots.lock().await;
        if let Some(slot) = slots.get(&job.peer_id) {
            slot.status.send_replace(job.status);
        }
    }

    /// Save the terminal job, free the device slot, then wake waiters
    async fn finish(&self, job: &DeploymentJob) {
        if let Err(e) = self.inner.store.save_job(job).await {
            log::error!("Failed to save job {}: {}", job.id, e);
        }
        let slot = self.inner.slots.lock().await.remove(&job.peer_id);
        if let Some(slot) = slot {
            slot.status.send_replace(job.status);
        }
    }

    async fn run(
        &self,
        mut job: DeploymentJob,
        peer: Peer,
        desired: DeviceState,
        cancel: Arc<AtomicBool>,
    ) {
        let _permit = self.inner.permits.acquire().await.ok();

        if cancel.load(Ordering::SeqCst) {
            if let Err(e) = job.cancel() {
                log::error!("Job {}: {}", job.id, e);
            }
            log::info!("{}: job {} cancelled before start", peer.name, job.id);
            self.finish(&job).await;
            return;
        }

        if let Err(e) = job.start(0) {
            log::error!("Job {}: {}", job.id, e);
            self.finish(&job).await;
            return;
        }
        log::info!("{}: job {} running", peer.name, job.id);
        self.persist(&job).await;

        let result = self.apply(&mut job, &peer, &desired, &cancel).await;
        let transition = match result {
            Ok(Applied::Done(verification)) => {
                log::info!(
                    "{}: job {} completed ({:?})",
                    peer.name,
                    job.id,
                    verification.outcome
                );
                let completed = job.complete(Some(verification.outcome));
                // Configuration was applied; failed checks only annotate the job
                if let Some(e) = verification.error() {
                    log::warn!("{}: {}", peer.name, e);
                    job.error = Some(e.to_string());
                }
                completed
            }
            Ok(Applied::Cancelled) => {
                log::info!(
                    "{}: job {} cancelled after {} call(s)",
                    peer.name,
                    job.id,
                    job.mutations_attempted()
                );
                job.cancel()
            }
            Err(e) => {
                log::error!("{}: job {} failed: {}", peer.name, job.id, e);
                job.fail(e.to_string())
            }
        };
        if let Err(e) = transition {
            log::error!("Job {}: {}", job.id, e);
        }
        self.finish(&job).await;
    }

    /// Snapshot, apply the ordered plan, then verify
    ///
    /// The first failing call stops the job; nothing is undone automatically.
    async fn apply(
        &self,
        job: &mut DeploymentJob,
        peer: &Peer,
        desired: &DeviceState,
        cancel: &AtomicBool,
    ) -> Result<Applied> {
        let client = match self.inner.connector.connect(peer).await {
            Ok(client) => client,
            Err(e) => {
                job.record(OperationRecord::new(
                    Method::Get,
                    "/",
                    "connect to device",
                    Outcome::Failure {
                        error: e.to_string(),
                    },
                ));
                return Err(e);
            }
        };

        // Successful snapshot reads stay out of the log; the failing one is kept
        let mut reads = Vec::new();
        let current = match reader::read_recorded(&client, &mut reads).await {
            Ok(current) => current,
            Err(e) => {
                for op in reads.into_iter().filter(|op| !op.is_success()) {
                    job.record(op);
                }
                return Err(e.into());
            }
        };
        job.snapshot = Some(current.clone());

        let calls = diff(desired, &current).plan();
        job.plan(calls.len());
        log::info!("{}: {} change(s) to apply", peer.name, calls.len());
        self.persist(job).await;

        for call in calls {
            if cancel.load(Ordering::SeqCst) {
                return Ok(Applied::Cancelled);
            }
            log::debug!("{}: {} ({} {})", peer.name, call.summary, call.method, call.path);
            let result = client.call(call.method, &call.path, call.body).await;
            let outcome = match &result {
                Ok(r) => Outcome::Success {
                    status: r.response.status,
                    attempts: r.attempts,
                },
                Err(e) => Outcome::Failure {
                    error: e.to_string(),
                },
            };
            job.record(OperationRecord::new(call.method, call.path, call.summary, outcome));
            self.persist(job).await;
            result?;
        }

        let verification = verify::verify_deployment(&client, desired, job.snapshot.as_ref()).await;
        job.record(OperationRecord::new(
            Method::Get,
            Category::Interface.path(),
            "verify deployment",
            Outcome::Verification {
                outcome: verification.outcome,
                notes: verification.notes.clone(),
            },
        ));
        Ok(Applied::Done(verification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Action;
    use crate::model::fixtures::{peer, subnet, wan};
    use crate::model::{DeviceType, TopologyMode};
    use crate::store::MemoryStore;
    use crate::transport::MemoryDevice;
    use std::time::Duration;

    struct Harness {
        executor: Executor,
        store: Arc<MemoryStore>,
        a: Arc<MemoryDevice>,
        b: Arc<MemoryDevice>,
    }

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
        }
    }

    fn harness(require_approval: bool) -> Harness {
        let mut config = Config::default();
        config.deploy.require_approval = require_approval;
        harness_with(config)
    }

    fn model() -> OverlayModel {
        let mut a = peer(1, "site-a", DeviceType::ManagedRouter, "10.0.0.1");
        a.subnets = vec![subnet(11, "192.168.1.0/24", true)];
        a.auto_deploy = true;
        let mut b = peer(2, "site-b", DeviceType::ManagedRouter, "10.0.0.2");
        b.subnets = vec![subnet(12, "192.168.2.0/24", true)];
        b.auto_deploy = true;
        let c = peer(3, "laptop", DeviceType::Client, "10.0.0.3");

        OverlayModel {
            wan: wan(TopologyMode::Mesh),
            peers: vec![a, b, c],
            services: Vec::new(),
        }
    }

    fn harness_with(config: Config) -> Harness {
        harness_on(config, Arc::new(MemoryStore::new(model())))
    }

    fn harness_on(config: Config, store: Arc<MemoryStore>) -> Harness {
        let dev_a = Arc::new(MemoryDevice::new());
        let dev_b = Arc::new(MemoryDevice::new());
        let mut connector = StaticConnector::new(policy());
        connector.insert(Uuid::from_u128(1), dev_a.clone());
        connector.insert(Uuid::from_u128(2), dev_b.clone());

        Harness {
            executor: Executor::new(store.clone(), Arc::new(connector), config),
            store,
            a: dev_a,
            b: dev_b,
        }
    }

    async fn deploy_and_wait(executor: &Executor, key: &str) -> DeploymentJob {
        match executor.deploy(key, true).await.unwrap() {
            DeployOutcome::Started(id) => executor.wait(id).await.unwrap(),
            DeployOutcome::NeedsApproval(_) => panic!("approval was given"),
        }
    }

    #[tokio::test]
    async fn test_deploy_requires_approval() {
        let h = harness(true);
        match h.executor.deploy("site-a", false).await.unwrap() {
            DeployOutcome::NeedsApproval(diff) => {
                assert!(diff.creates().count() > 0);
                assert_eq!(diff.deletes().count(), 0);
            }
            DeployOutcome::Started(_) => panic!("started without approval"),
        }
        assert_eq!(h.a.mutation_count().await, 0);
    }

    #[tokio::test]
    async fn test_deploy_then_redeploy_is_empty() {
        let h = harness(true);
        let job = deploy_and_wait(&h.executor, "site-a").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.verification, Some(VerificationOutcome::Passed));
        assert_eq!(job.snapshot, Some(DeviceState::default()));
        // Every planned call plus one verification entry
        assert_eq!(job.operations.len(), job.planned + 1);

        assert!(h.executor.preview("site-a").await.unwrap().is_empty());
        let second = deploy_and_wait(&h.executor, "site-a").await;
        assert_eq!(second.planned, 0);
        assert_eq!(second.operations.len(), 1);
    }

    #[tokio::test]
    async fn test_unmanaged_peer_is_rejected() {
        let h = harness(false);
        assert!(matches!(
            h.executor.deploy("laptop", true).await,
            Err(Error::NotManaged(_))
        ));
        assert!(matches!(
            h.executor.deploy("nobody", true).await,
            Err(Error::PeerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_failure_stops_the_job() {
        let h = harness(false);
        h.a.fail_mutation(3, 400, "invalid value for argument").await;

        let job = deploy_and_wait(&h.executor, "site-a").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.operations.len(), 3);
        assert_eq!(job.operations.iter().filter(|o| o.is_success()).count(), 2);
        assert!(job.error.as_deref().unwrap_or_default().contains("Validation"));
        assert_eq!(h.a.mutation_count().await, 3);
        assert!(job.progress < 1.0);
    }

    #[tokio::test]
    async fn test_device_busy_and_cancel() {
        let mut config = Config::default();
        config.deploy.max_concurrent_deployments = 1;
        let h = harness_with(config);

        // Hold the only permit so the job stays pending
        let permit = h.executor.inner.permits.acquire().await.unwrap();
        let first = match h.executor.deploy("site-a", true).await.unwrap() {
            DeployOutcome::Started(id) => id,
            DeployOutcome::NeedsApproval(_) => panic!("approval was given"),
        };
        assert_eq!(h.executor.job(first).await.unwrap().status, JobStatus::Pending);
        assert!(matches!(
            h.executor.deploy("site-a", true).await,
            Err(Error::DeviceBusy { job, .. }) if job == first
        ));

        h.executor.cancel(first).await.unwrap();
        drop(permit);

        let job = h.executor.wait(first).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.operations.is_empty());
        assert_eq!(h.a.mutation_count().await, 0);

        // The slot is free again; the terminal job cannot be cancelled
        assert!(matches!(
            h.executor.cancel(first).await,
            Err(Error::InvalidTransition { .. })
        ));
        let job = deploy_and_wait(&h.executor, "site-a").await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_device_busy_across_executors_sharing_a_journal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = crate::state_file::journal_path(dir.path());
        let mut config = Config::default();
        config.deploy.max_concurrent_deployments = 1;
        let journaled = || Arc::new(MemoryStore::with_journal(model(), &path).unwrap());
        let first = harness_on(config.clone(), journaled());
        let second = harness_on(config, journaled());

        let permit = first.executor.inner.permits.acquire().await.unwrap();
        let held = match first.executor.deploy("site-a", true).await.unwrap() {
            DeployOutcome::Started(id) => id,
            DeployOutcome::NeedsApproval(_) => panic!("approval was given"),
        };
        assert!(matches!(
            second.executor.deploy("site-a", true).await,
            Err(Error::DeviceBusy { job, .. }) if job == held
        ));
        assert_eq!(second.a.mutation_count().await, 0);

        // Other devices stay available
        let other = deploy_and_wait(&second.executor, "site-b").await;
        assert_eq!(other.status, JobStatus::Completed);

        drop(permit);
        assert_eq!(
            first.executor.wait(held).await.unwrap().status,
            JobStatus::Completed
        );
        let job = deploy_and_wait(&second.executor, "site-a").await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_stale_unfinished_job_does_not_hold_the_device() {
        let h = harness(false);
        let mut stuck = DeploymentJob::new(Uuid::from_u128(1), JobKind::Deploy);
        stuck.start(3).unwrap();
        stuck.created_at = Utc::now() - chrono::Duration::hours(3);
        stuck.started_at = Some(Utc::now() - chrono::Duration::hours(2));
        h.store.save_job(&stuck).await.unwrap();

        let job = deploy_and_wait(&h.executor, "site-a").await;
        assert_eq!(job.status, JobStatus::Completed);

        let mut recent = DeploymentJob::new(Uuid::from_u128(1), JobKind::Deploy);
        recent.start(3).unwrap();
        h.store.save_job(&recent).await.unwrap();
        assert!(matches!(
            h.executor.deploy("site-a", true).await,
            Err(Error::DeviceBusy { job, .. }) if job == recent.id
        ));
    }

    #[tokio::test]
    async fn test_failed_snapshot_read_logs_only_the_failure() {
        let h = harness(false);
        h.a.set_offline(true).await;

        let job = deploy_and_wait(&h.executor, "site-a").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.operations.len(), 1);
        assert!(!job.operations[0].is_success());
        assert!(job.error.as_deref().unwrap_or_default().contains("Connection error"));
        assert!(job.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_is_logged() {
        let store = Arc::new(MemoryStore::new(model()));
        let executor = Executor::new(
            store,
            Arc::new(StaticConnector::new(policy())),
            Config::default(),
        );

        let job = deploy_and_wait(&executor, "site-a").await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.operations.len(), 1);
        assert_eq!(job.operations[0].summary, "connect to device");
        assert!(job
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("no management access"));
    }

    #[tokio::test]
    async fn test_service_only_subnet_in_shared_range_deploys() {
        let h = harness(false);
        let mut a = h.store.model().await.unwrap().peers[0].clone();
        a.subnets.push(subnet(13, "10.0.5.0/26", false));
        h.store.save_peer(a.clone()).await.unwrap();

        let job = deploy_and_wait(&h.executor, "site-a").await;
        assert_eq!(job.status, JobStatus::Completed);

        // Routing the same range would shadow shared-service addresses
        a.subnets[1].routed = true;
        h.store.save_peer(a).await.unwrap();
        assert!(matches!(
            h.executor.deploy("site-a", true).await,
            Err(Error::Blocked { count: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_on_one_device_does_not_affect_another() {
        let h = harness(false);
        h.b.set_offline(true).await;
        let results = h.executor.deploy_all(true).await.unwrap();
        assert_eq!(results.len(), 2);

        for (peer, outcome) in results {
            let DeployOutcome::Started(id) = outcome.unwrap() else {
                panic!("approval was given");
            };
            let job = h.executor.wait(id).await.unwrap();
            match peer.name.as_str() {
                "site-a" => assert_eq!(job.status, JobStatus::Completed),
                "site-b" => {
                    assert_eq!(job.status, JobStatus::Failed);
                    assert!(job.error.unwrap().contains("Connection error"));
                }
                other => panic!("unexpected peer {}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_rollback_removes_what_the_deploy_added() {
        let h = harness(false);
        assert!(matches!(
            h.executor.rollback("site-a").await,
            Err(Error::NoPriorState(_))
        ));

        let deployed = deploy_and_wait(&h.executor, "site-a").await;
        let created = deployed.planned;

        let preview = h.executor.preview_rollback("site-a").await.unwrap();
        assert_eq!(preview.deletes().count(), created);
        assert_eq!(preview.creates().count(), 0);
        assert_eq!(preview.updates().count(), 0);

        let id = h.executor.rollback("site-a").await.unwrap();
        let job = h.executor.wait(id).await.unwrap();
        assert_eq!(job.kind, JobKind::Rollback);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(reader::read(&DeviceClient::new(h.a.clone(), policy()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_deploy() {
        let h = harness(false);
        h.a.fail_mutation(1, 400, "bad value").await;
        let failed = deploy_and_wait(&h.executor, "site-a").await;
        assert_eq!(failed.status, JobStatus::Failed);

        let retry_id = h.executor.retry(failed.id).await.unwrap();
        let retried = h.executor.wait(retry_id).await.unwrap();
        assert_eq!(retried.retry_of, Some(failed.id));
        assert_eq!(retried.status, JobStatus::Completed);

        // Completed jobs are not retried
        assert!(matches!(
            h.executor.retry(retried.id).await,
            Err(Error::InvalidTransition { .. })
        ));
        let jobs = h.executor.jobs_for_peer("site-a").await.unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_test_connection_updates_peer_status() {
        let h = harness(false);
        h.a.set_identity("branch-a").await;
        let job = h.executor.test_connection("site-a").await.unwrap();
        assert_eq!(job.kind, JobKind::TestConnection);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.operations.len(), 2);

        let model = h.store.model().await.unwrap();
        let a = model.find_peer("site-a").unwrap();
        assert_eq!(a.api_status, ApiStatus::Connected);
        assert_eq!(a.router_identity.as_deref(), Some("branch-a"));
        assert!(a.last_api_check.is_some());

        h.b.force_status(Some(401)).await;
        let job = h.executor.test_connection("site-b").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let model = h.store.model().await.unwrap();
        assert_eq!(
            model.find_peer("site-b").unwrap().api_status,
            ApiStatus::AuthFailed
        );
    }

    #[tokio::test]
    async fn test_verify_reports_drift() {
        let h = harness(false);
        let report = h.executor.verify("site-a").await.unwrap();
        assert_eq!(report.job.status, JobStatus::Completed);
        assert_eq!(report.job.verification, Some(VerificationOutcome::Warnings));
        let drift = report.drift.unwrap();
        assert!(!drift.in_sync);
        assert!(drift.diff.changes.iter().all(|c| c.action == Action::Create));

        deploy_and_wait(&h.executor, "site-a").await;
        let report = h.executor.verify("site-a").await.unwrap();
        assert!(report.drift.unwrap().in_sync);
        assert_eq!(report.job.verification, Some(VerificationOutcome::Passed));
        // Six reads plus the comparison
        assert_eq!(report.job.operations.len(), 7);
    }
}
