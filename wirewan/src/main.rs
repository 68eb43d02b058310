// WireGuard WAN Overlay Reconciliation CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use uuid::Uuid;
use wirewan::{
    client::CallPolicy,
    config::{load_config, load_model},
    conflict,
    diff::Diff,
    executor::{DeployOutcome, Executor, RestConnector},
    export,
    job::{DeploymentJob, JobStatus, Outcome},
    state_file,
    store::MemoryStore,
    translation,
};

#[derive(Parser)]
#[command(name = "wirewan")]
#[command(about = "WireGuard WAN overlay reconciliation for MikroTik routers", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wirewan/config.toml")]
    config: PathBuf,

    /// Path to the overlay model file
    #[arg(short, long, default_value = "/etc/wirewan/model.toml")]
    model: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report subnet conflicts across the WAN
    Conflicts,
    /// Show the changes a deployment would make
    Preview { peer: String },
    /// Check for clashes with unmanaged resources on the device
    Preflight { peer: String },
    /// Deploy one peer (shows the diff unless --approve is given)
    Deploy {
        peer: String,
        #[arg(long)]
        approve: bool,
    },
    /// Deploy every auto-deploy managed router
    DeployAll {
        #[arg(long)]
        approve: bool,
    },
    /// Compare the device with the model
    Verify { peer: String },
    /// Test API connectivity and RouterOS version
    Test { peer: String },
    /// Restore the state captured before the last deployment
    Rollback { peer: String },
    /// Retry a failed job
    Retry { job: Uuid },
    /// List a peer's jobs
    Jobs { peer: String },
    /// Print the desired configuration as a RouterOS script
    Export { peer: String },
}

fn main() -> Result<()> {
    // Device calls are I/O bound; a small pool is enough
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .thread_name("wirewan")
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

fn print_diff(diff: &Diff) {
    if diff.is_empty() {
        println!("No changes");
        return;
    }
    for change in &diff.changes {
        println!("  {}", change);
        for (key, value) in &change.fields {
            println!("      {} = {}", key, value);
        }
    }
    println!(
        "{} to create, {} to update, {} to delete",
        diff.creates().count(),
        diff.updates().count(),
        diff.deletes().count()
    );
}

fn print_job(job: &DeploymentJob) {
    println!(
        "Job {} ({:?}) {:?}, progress {:.0}%",
        job.id,
        job.kind,
        job.status,
        job.progress * 100.0
    );
    for op in &job.operations {
        let outcome = match &op.outcome {
            Outcome::Success { status, attempts } => format!("{} ({} attempt(s))", status, attempts),
            Outcome::Failure { error } => format!("FAILED: {}", error),
            Outcome::Verification { outcome, notes } => {
                format!("{:?} {}", outcome, notes.join("; "))
            }
        };
        println!("  {} {} {} -> {}", op.method, op.path, op.summary, outcome);
    }
    if let Some(error) = &job.error {
        println!("  error: {}", error);
    }
}

/// Wait for a job, cancelling it on SIGINT/SIGTERM
async fn follow(executor: &Executor, job_id: Uuid) -> Result<DeploymentJob> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    let interrupted = tokio::select! {
        job = executor.wait(job_id) => return Ok(job?),
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    log::info!("Received {}, cancelling job {}", interrupted, job_id);
    if let Err(e) = executor.cancel(job_id).await {
        log::warn!("Failed to cancel job {}: {}", job_id, e);
    }
    Ok(executor.wait(job_id).await?)
}

fn check_job(job: &DeploymentJob) -> Result<()> {
    print_job(job);
    if job.status != JobStatus::Completed {
        anyhow::bail!("Job {} ended {:?}", job.id, job.status);
    }
    Ok(())
}

async fn async_main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    let model = load_model(&args.model)
        .with_context(|| format!("Failed to load model from {:?}", args.model))?;
    log::info!(
        "WAN {}: {} peer(s), {} service(s)",
        model.wan.name,
        model.peers.len(),
        model.services.len()
    );

    if let Command::Conflicts = args.command {
        let model = translation::materialize(&model).context("Failed to plan addresses")?;
        let conflicts = conflict::detect_all(&model);
        if conflicts.is_empty() {
            println!("No conflicts");
        }
        for c in &conflicts {
            println!(
                "[{:?}{}] {}",
                c.severity,
                if c.resolved { ", resolved" } else { "" },
                c.description
            );
        }
        return Ok(());
    }

    let journal = state_file::journal_path(&config.general.state_dir);
    let store = Arc::new(MemoryStore::with_journal(model, &journal)?);
    let connector = Arc::new(RestConnector::new(
        CallPolicy::from_config(&config.deploy),
        config.defaults.api_port,
    ));
    let executor = Executor::new(store, connector, config);

    match args.command {
        Command::Conflicts => {}
        Command::Preview { peer } => print_diff(&executor.preview(&peer).await?),
        Command::Preflight { peer } => {
            let report = executor.preflight(&peer).await?;
            for clash in &report.clashes {
                println!("clash: {} {}: {}", clash.category, clash.resource, clash.detail);
            }
            for c in &report.route_conflicts {
                println!("warning: {}", c.description);
            }
            if !report.is_clear() {
                anyhow::bail!("{} clash(es) with unmanaged resources", report.clashes.len());
            }
            println!("Preflight passed");
        }
        Command::Deploy { peer, approve } => match executor.deploy(&peer, approve).await? {
            DeployOutcome::NeedsApproval(diff) => {
                print_diff(&diff);
                println!("Re-run with --approve to apply");
            }
            DeployOutcome::Started(id) => check_job(&follow(&executor, id).await?)?,
        },
        Command::DeployAll { approve } => {
            let mut failed = 0;
            for (peer, outcome) in executor.deploy_all(approve).await? {
                println!("== {}", peer.name);
                let result = match outcome {
                    Ok(DeployOutcome::NeedsApproval(diff)) => {
                        print_diff(&diff);
                        Ok(())
                    }
                    Ok(DeployOutcome::Started(id)) => match follow(&executor, id).await {
                        Ok(job) => check_job(&job),
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    log::error!("{}: {:#}", peer.name, e);
                    failed += 1;
                }
            }
            if failed > 0 {
                anyhow::bail!("{} deployment(s) failed", failed);
            }
        }
        Command::Verify { peer } => {
            let report = executor.verify(&peer).await?;
            if let Some(drift) = &report.drift {
                if drift.in_sync {
                    println!("In sync");
                }
                for issue in &drift.issues {
                    println!("drift: {}", issue);
                }
            }
            print_job(&report.job);
        }
        Command::Test { peer } => check_job(&executor.test_connection(&peer).await?)?,
        Command::Rollback { peer } => {
            let id = executor.rollback(&peer).await?;
            check_job(&follow(&executor, id).await?)?;
        }
        Command::Retry { job } => {
            let id = executor.retry(job).await?;
            check_job(&follow(&executor, id).await?)?;
        }
        Command::Jobs { peer } => {
            for job in executor.jobs_for_peer(&peer).await? {
                println!(
                    "{} {:?} {:?} {} {}",
                    job.id,
                    job.kind,
                    job.status,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Export { peer } => {
            print!("{}", export::routeros_script(&executor.desired_state(&peer).await?));
        }
    }

    Ok(())
}
