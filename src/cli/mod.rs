//! Command-line interface for landscout.
//!
//! Provides commands for queueing and running collection jobs, reviewing
//! proposed changes, repairing linkage, and running the orchestrator as a
//! long-lived service.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::adapters::CommandCollector;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    JobFilter, JobStore, Orchestrator, ReviewOutcome, StrandedDependent,
};
use crate::domain::{
    ChangeStatus, Decision, EntityType, JobStatus, JobType, NewJob, ParentRef, DEFAULT_PRIORITY,
};

/// landscout - Collection job orchestrator for real-estate discovery
#[derive(Parser, Debug)]
#[command(name = "landscout")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Job database (overrides config and LANDSCOUT_DB)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue a job
    Create {
        /// community, builder, property or sales_rep
        entity_type: EntityType,

        /// discovery, update or inventory
        #[arg(short = 't', long, default_value = "discovery")]
        job_type: JobType,

        /// Search query for the collector
        #[arg(short, long)]
        query: Option<String>,

        /// Existing entity to update or inventory
        #[arg(long)]
        entity_id: Option<Uuid>,

        #[arg(short, long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,

        /// Link to a committed parent entity
        #[arg(long, conflicts_with = "parent_change")]
        parent_entity: Option<Uuid>,

        /// Link to a pending parent change
        #[arg(long)]
        parent_change: Option<Uuid>,

        /// Collector filters as a JSON object
        #[arg(long)]
        filters: Option<String>,
    },

    /// Run the next pending job and wait for it to finish
    Start,

    /// List jobs
    Jobs {
        #[arg(short, long)]
        status: Option<JobStatus>,

        #[arg(short, long)]
        entity_type: Option<EntityType>,

        #[arg(short, long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show one job
    Job { id: Uuid },

    /// Delete a job that is not running
    Delete { id: Uuid },

    /// Fail jobs running longer than the timeout
    ResetStuck {
        /// Defaults to reaper.timeout_minutes
        #[arg(long)]
        timeout_minutes: Option<u64>,
    },

    /// Job counts by entity type and status
    Stats,

    /// List proposed changes
    Changes {
        #[arg(short, long)]
        status: Option<ChangeStatus>,

        #[arg(long)]
        json: bool,
    },

    /// Approve or reject a change
    Review {
        change_id: Uuid,

        #[arg(value_enum)]
        decision: ReviewDecision,

        /// Note recorded with a rejection
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Auto-review all pending changes
    AutoReview,

    /// Queue discovery jobs from a file of queries (one per line)
    Discover {
        entity_type: EntityType,

        file: PathBuf,

        #[arg(short, long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,
    },

    /// Queue update jobs for every entity of a type without an open job
    QueueUpdates {
        entity_type: EntityType,

        #[arg(short, long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,
    },

    /// List committed entities
    Entities {
        #[arg(short, long)]
        entity_type: Option<EntityType>,
    },

    /// List jobs and changes stranded under a rejected change
    Stranded {
        #[arg(long)]
        json: bool,
    },

    /// Point dependents of a rejected change at a committed entity
    Relink { change_id: Uuid, entity_id: Uuid },

    /// Run the reaper and start jobs until interrupted
    Serve,

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        if let Commands::Config = self.command {
            return show_config(cfg);
        }

        let orch = open_orchestrator(cfg, self.db.as_deref())?;

        match self.command {
            Commands::Create {
                entity_type,
                job_type,
                query,
                entity_id,
                priority,
                parent_entity,
                parent_change,
                filters,
            } => {
                let search_filters = filters
                    .map(|raw| serde_json::from_str(&raw).context("Invalid --filters JSON"))
                    .transpose()?;
                let parent_ref = parent_entity
                    .map(ParentRef::CommittedEntity)
                    .or(parent_change.map(ParentRef::PendingChange));

                let id = orch.create_job(NewJob {
                    entity_type,
                    job_type,
                    priority,
                    entity_id,
                    parent_ref,
                    search_query: query,
                    search_filters,
                    context: None,
                })?;
                println!("{}", id);
                Ok(())
            }
            Commands::Start => start(&orch).await,
            Commands::Jobs {
                status,
                entity_type,
                limit,
                offset,
                json,
            } => {
                let filter = JobFilter {
                    status,
                    entity_type,
                    limit,
                    offset,
                };
                list_jobs(&orch, &filter, json)
            }
            Commands::Job { id } => print_json(&orch.get_job(id)?),
            Commands::Delete { id } => {
                let removed = orch.delete_job(id)?;
                println!("Deleted job {} ({} change(s) removed)", id, removed);
                Ok(())
            }
            Commands::ResetStuck { timeout_minutes } => {
                let minutes = timeout_minutes.unwrap_or(cfg.settings.reaper_timeout_minutes);
                let ids = orch.reset_stuck_jobs(minutes)?;
                if ids.is_empty() {
                    println!("No stuck jobs");
                }
                for id in ids {
                    println!("Failed stuck job {}", id);
                }
                Ok(())
            }
            Commands::Stats => show_stats(&orch),
            Commands::Changes { status, json } => list_changes(&orch, status, json),
            Commands::Review {
                change_id,
                decision,
                reason,
            } => {
                let decision = match decision {
                    ReviewDecision::Approve => Decision::Approve,
                    ReviewDecision::Reject => Decision::Reject { reason },
                };
                let outcome = orch.review_change(change_id, decision)?;
                print_review(change_id, &outcome);
                Ok(())
            }
            Commands::AutoReview => {
                let summary = orch.review_pending()?;
                println!(
                    "Examined {}: {} approved, {} held, {} error(s)",
                    summary.examined, summary.approved, summary.held, summary.errors
                );
                Ok(())
            }
            Commands::Discover {
                entity_type,
                file,
                priority,
            } => {
                let queries = read_queries(&file)?;
                let ids = orch.bulk_discover(entity_type, &queries, priority)?;
                println!("Queued {} of {} queries", ids.len(), queries.len());
                Ok(())
            }
            Commands::QueueUpdates {
                entity_type,
                priority,
            } => {
                let ids = orch.queue_updates(entity_type, priority)?;
                println!("Queued {} update job(s)", ids.len());
                Ok(())
            }
            Commands::Entities { entity_type } => {
                let entities = orch.list_entities(entity_type)?;
                if entities.is_empty() {
                    println!("No entities found");
                    return Ok(());
                }
                println!("{:<38} {:<10} {:<38} NAME", "ENTITY ID", "TYPE", "PARENT");
                println!("{}", "-".repeat(110));
                for entity in entities {
                    let parent = entity
                        .parent_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<38} {:<10} {:<38} {}",
                        entity.id, entity.entity_type, parent, entity.name
                    );
                }
                Ok(())
            }
            Commands::Stranded { json } => list_stranded(&orch, json),
            Commands::Relink {
                change_id,
                entity_id,
            } => {
                let (jobs, changes) = orch.relink(change_id, entity_id)?;
                println!(
                    "Relinked {} job(s) and {} change(s) to {}",
                    jobs, changes, entity_id
                );
                Ok(())
            }
            Commands::Serve => serve(&orch, cfg).await,
            Commands::Config => Ok(()),
        }
    }
}

fn open_orchestrator(cfg: &ResolvedConfig, db: Option<&std::path::Path>) -> Result<Orchestrator> {
    let path = db.unwrap_or(&cfg.database);
    let store = JobStore::open(path)
        .with_context(|| format!("Failed to open job database: {}", path.display()))?;

    let settings = &cfg.settings;
    let collector = CommandCollector::new(
        settings.collector_command.clone(),
        settings.collector_args.clone(),
        settings.collector_timeout(),
    );

    Ok(Orchestrator::new(
        store,
        Arc::new(collector),
        settings.orchestrator(),
    ))
}

/// Start the next job and wait for its execution to settle
async fn start(orch: &Orchestrator) -> Result<()> {
    let (outcome, handle) = orch.start_next_tracked()?;

    let (Some(job_id), Some(handle)) = (outcome.job_id, handle) else {
        println!(
            "Not started: {} ({} pending)",
            outcome.reason.as_deref().unwrap_or("unknown"),
            outcome.pending_count
        );
        return Ok(());
    };

    eprintln!("[Job {} started, {} pending]", job_id, outcome.pending_count);
    handle.await.context("Job execution task failed")?;

    let job = orch.get_job(job_id)?;
    match job.status {
        JobStatus::Completed => eprintln!("[Job {} completed]", job_id),
        JobStatus::Failed => {
            eprintln!(
                "[Job {} failed: {}]",
                job_id,
                job.error_message.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
        status => eprintln!("[Job {} is {}]", job_id, status),
    }
    Ok(())
}

fn list_jobs(orch: &Orchestrator, filter: &JobFilter, json: bool) -> Result<()> {
    let jobs = orch.list_jobs(filter)?;
    if json {
        return print_json(&jobs);
    }

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<10} {:<10} {:<4} QUERY",
        "JOB ID", "TYPE", "KIND", "STATUS", "PRI"
    );
    println!("{}", "-".repeat(100));

    for job in jobs {
        println!(
            "{:<38} {:<10} {:<10} {:<10} {:<4} {}",
            job.id,
            job.entity_type,
            job.job_type.as_str(),
            job.status,
            job.priority,
            job.search_query.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

fn show_stats(orch: &Orchestrator) -> Result<()> {
    let stats = orch.get_stats()?;

    println!(
        "{:<10} {:>8} {:>8} {:>10} {:>8}",
        "TYPE", "PENDING", "RUNNING", "COMPLETED", "FAILED"
    );
    println!("{}", "-".repeat(48));
    for entity_type in EntityType::ALL {
        println!(
            "{:<10} {:>8} {:>8} {:>10} {:>8}",
            entity_type.as_str(),
            stats.count(entity_type, JobStatus::Pending),
            stats.count(entity_type, JobStatus::Running),
            stats.count(entity_type, JobStatus::Completed),
            stats.count(entity_type, JobStatus::Failed),
        );
    }
    println!("{}", "-".repeat(48));
    println!("Total: {}", stats.total());

    Ok(())
}

fn list_changes(orch: &Orchestrator, status: Option<ChangeStatus>, json: bool) -> Result<()> {
    let changes = orch.list_changes(status)?;
    if json {
        return print_json(&changes);
    }

    if changes.is_empty() {
        println!("No changes found");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<9} {:>5} {:<28} NAME",
        "CHANGE ID", "TYPE", "STATUS", "CONF", "PARENT"
    );
    println!("{}", "-".repeat(110));

    for change in changes {
        let parent = change
            .parent_ref
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<10} {:<9} {:>5.2} {:<28} {}",
            change.id,
            change.entity_type,
            change.status,
            change.confidence,
            parent,
            change.proposed_data.display_name()
        );
    }

    Ok(())
}

fn list_stranded(orch: &Orchestrator, json: bool) -> Result<()> {
    let stranded = orch.stranded_dependents()?;
    if json {
        return print_json(&stranded);
    }

    if stranded.is_empty() {
        println!("No stranded dependents");
        return Ok(());
    }

    for dependent in &stranded {
        match dependent {
            StrandedDependent::Job { job, parent_change } => {
                let context = job
                    .context
                    .as_ref()
                    .map(|c| match &c.location {
                        Some(location) => format!("{} ({})", c.name, location),
                        None => c.name.clone(),
                    })
                    .or_else(|| job.search_query.clone())
                    .unwrap_or_default();
                println!(
                    "job    {} [{}] under {}: {}",
                    job.id, job.status, parent_change, context
                );
            }
            StrandedDependent::Change {
                change,
                parent_change,
            } => {
                println!(
                    "change {} [{}] under {}: {}",
                    change.id,
                    change.status,
                    parent_change,
                    change.proposed_data.display_name()
                );
            }
        }
    }
    eprintln!("\nUse `landscout relink <change-id> <entity-id>` to reattach them.");

    Ok(())
}

fn print_review(change_id: Uuid, outcome: &ReviewOutcome) {
    match outcome {
        ReviewOutcome::Approved { receipt, cascaded } => {
            println!(
                "Approved {} → entity {} ({} job(s) relinked, {} dependent change(s) approved)",
                change_id,
                receipt.entity_id,
                receipt.jobs_relinked,
                cascaded.len()
            );
        }
        ReviewOutcome::Rejected { stranded } => {
            println!("Rejected {} ({} dependent(s) stranded)", change_id, stranded);
        }
        ReviewOutcome::Held(reason) => println!("Held {}: {}", change_id, reason),
        ReviewOutcome::AlreadyReviewed { status } => {
            println!("Change {} is already {}", change_id, status)
        }
    }
}

/// Queries from a file, skipping blank lines and `#` comments
fn read_queries(path: &std::path::Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read query file: {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Reaper plus a polling loop over `start_next`, until Ctrl-C
async fn serve(orch: &Orchestrator, cfg: &ResolvedConfig) -> Result<()> {
    info!(
        database = %cfg.database.display(),
        poll_secs = cfg.settings.poll_interval().as_secs(),
        "Serving; press Ctrl-C to stop"
    );
    serve_until(orch, cfg.settings.poll_interval(), tokio::signal::ctrl_c()).await
}

/// Run the reaper and start jobs on every tick until `shutdown` resolves
async fn serve_until<F>(orch: &Orchestrator, poll: Duration, shutdown: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = orch.spawn_reaper(shutdown_rx);

    let mut ticker = tokio::time::interval(poll);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match orch.start_next() {
                    Ok(outcome) if outcome.started => {
                        info!(job_id = ?outcome.job_id, pending = outcome.pending_count, "Dispatched job");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to start next job"),
                }
            }
            signal = &mut shutdown => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutting down");
                break;
            }
        }
    }

    // A job still running is left to the reaper of the next session
    let _ = shutdown_tx.send(true);
    reaper.await.context("Reaper task failed")?;
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("landscout configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!();

    let s = &cfg.settings;
    println!("Executor:");
    println!("  Poll interval: {}s", s.poll_interval_secs);
    println!("Reaper:");
    println!("  Interval: {}s", s.reaper_interval_secs);
    println!("  Timeout:  {} minutes", s.reaper_timeout_minutes);
    println!("Review:");
    println!("  Approval threshold: {:.2}", s.approval_threshold);
    println!("Collector:");
    println!("  Command: {} {}", s.collector_command, s.collector_args.join(" "));
    println!("  Timeout: {}s", s.collector_timeout_secs);

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
