// Persistence collaborator

//! Persistence seam for overlay records and deployment jobs
//!
//! The engine treats storage as a collaborator: it loads the overlay model,
//! writes back peer status after connection tests, and saves every job state
//! change. [`MemoryStore`] keeps the model in memory. Its jobs live either in
//! memory or in a journal file that several CLI processes can share.

use crate::job::DeploymentJob;
use crate::model::{ApiStatus, OverlayModel, Peer};
use crate::state_file;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Result of a management API check, written back onto a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCheck {
    /// Reachability and authentication result
    pub status: ApiStatus,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
    /// Router identity; `None` keeps the last known one
    pub identity: Option<String>,
    /// RouterOS version; `None` keeps the last known one
    pub version: Option<String>,
}

/// Load/save of overlay records and jobs
#[async_trait]
pub trait OverlayStore: Send + Sync {
    /// Current overlay model (WAN, peers, services)
    async fn model(&self) -> Result<OverlayModel>;

    /// Replace a peer record
    async fn save_peer(&self, peer: Peer) -> Result<()>;

    /// Update only the API status fields of a peer
    async fn record_api_check(&self, peer_id: Uuid, check: ApiCheck) -> Result<()>;

    /// Insert or replace a job
    async fn save_job(&self, job: &DeploymentJob) -> Result<()>;

    /// A job by id
    async fn job(&self, id: Uuid) -> Result<DeploymentJob>;

    /// Jobs of a peer, oldest first
    async fn jobs_for_peer(&self, peer_id: Uuid) -> Result<Vec<DeploymentJob>>;
}

fn upsert(jobs: &mut Vec<DeploymentJob>, job: DeploymentJob) {
    match jobs.iter_mut().find(|j| j.id == job.id) {
        Some(existing) => *existing = job,
        None => jobs.push(job),
    }
}

/// Run blocking journal I/O off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Store(format!("journal task failed: {}", e)))?
        .map_err(|e| Error::Store(format!("{:#}", e)))
}

/// Job journal file, re-read on every access so other processes' jobs are seen
struct Journal {
    path: PathBuf,
    /// Serializes this process's read-modify-write cycles
    write: Mutex<()>,
}

impl Journal {
    async fn load(&self) -> Result<Vec<DeploymentJob>> {
        let path = self.path.clone();
        blocking(move || state_file::read_jobs(&path)).await
    }

    /// Merge one job into the file, keeping everything else in it
    async fn save(&self, job: DeploymentJob) -> Result<()> {
        let _guard = self.write.lock().await;
        let path = self.path.clone();
        blocking(move || {
            let mut jobs = state_file::read_jobs(&path)?;
            upsert(&mut jobs, job);
            state_file::write_jobs(&path, &jobs)
        })
        .await
    }
}

/// In-memory store, optionally journaling jobs to a file
pub struct MemoryStore {
    model: RwLock<OverlayModel>,
    jobs: RwLock<Vec<DeploymentJob>>,
    journal: Option<Journal>,
}

impl MemoryStore {
    /// Store keeping jobs in memory only
    pub fn new(model: OverlayModel) -> Self {
        Self {
            model: RwLock::new(model),
            jobs: RwLock::new(Vec::new()),
            journal: None,
        }
    }

    /// Store whose jobs are read from and written through to `path`
    pub fn with_journal(model: OverlayModel, path: &Path) -> Result<Self> {
        let jobs = state_file::read_jobs(path).map_err(|e| Error::Store(format!("{:#}", e)))?;
        log::debug!("Journal {:?} holds {} jobs", path, jobs.len());
        Ok(Self {
            model: RwLock::new(model),
            jobs: RwLock::new(Vec::new()),
            journal: Some(Journal {
                path: path.to_path_buf(),
                write: Mutex::new(()),
            }),
        })
    }

    async fn jobs(&self) -> Result<Vec<DeploymentJob>> {
        match &self.journal {
            Some(journal) => journal.load().await,
            None => Ok(self.jobs.read().await.clone()),
        }
    }
}

#[async_trait]
impl OverlayStore for MemoryStore {
    async fn model(&self) -> Result<OverlayModel> {
        Ok(self.model.read().await.clone())
    }

    async fn save_peer(&self, peer: Peer) -> Result<()> {
        let mut model = self.model.write().await;
        match model.peers.iter_mut().find(|p| p.id == peer.id) {
            Some(existing) => {
                *existing = peer;
                Ok(())
            }
            None => Err(Error::PeerNotFound(peer.id.to_string())),
        }
    }

    async fn record_api_check(&self, peer_id: Uuid, check: ApiCheck) -> Result<()> {
        let mut model = self.model.write().await;
        let peer = model
            .peers
            .iter_mut()
            .find(|p| p.id == peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        peer.api_status = check.status;
        peer.last_api_check = Some(check.checked_at);
        if let Some(identity) = check.identity {
            peer.router_identity = Some(identity);
        }
        if let Some(version) = check.version {
            peer.router_version = Some(version);
        }
        Ok(())
    }

    async fn save_job(&self, job: &DeploymentJob) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.save(job.clone()).await,
            None => {
                upsert(&mut *self.jobs.write().await, job.clone());
                Ok(())
            }
        }
    }

    async fn job(&self, id: Uuid) -> Result<DeploymentJob> {
        self.jobs()
            .await?
            .into_iter()
            .find(|j| j.id == id)
            .ok_or(Error::JobNotFound(id))
    }

    async fn jobs_for_peer(&self, peer_id: Uuid) -> Result<Vec<DeploymentJob>> {
        let mut jobs: Vec<DeploymentJob> = self
            .jobs()
            .await?
            .into_iter()
            .filter(|j| j.peer_id == peer_id)
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
