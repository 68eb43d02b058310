// Job journal

//! Job journal on disk
//!
//! The CLI runs one command per process, so deployment jobs (and the snapshots
//! rollback needs) are journaled to `<state_dir>/jobs.json` between runs.

use crate::job::DeploymentJob;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const JOURNAL_FILE: &str = "jobs.json";

/// Journal location inside a state directory
pub fn journal_path<P: AsRef<Path>>(state_dir: P) -> PathBuf {
    state_dir.as_ref().join(JOURNAL_FILE)
}

/// Write all jobs, replacing the previous journal
pub fn write_jobs(path: &Path, jobs: &[DeploymentJob]) -> Result<()> {
    // Create directory if it doesn't exist
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory {:?}", dir))?;
        }
    }

    let content = serde_json::to_string_pretty(jobs).context("Failed to serialize jobs")?;

    // Write next to the journal and rename so readers never see a partial file
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;

    Ok(())
}

/// Read the journal; a missing file is an empty journal
pub fn read_jobs(path: &Path) -> Result<Vec<DeploymentJob>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}
