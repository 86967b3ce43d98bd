//! Single-flight sequential executor.
//!
//! `start_next` claims the highest-priority pending job and hands it to the
//! collector on a background task. The store's conditional claim guarantees
//! that at most one job runs at a time, however many callers race.

use std::any::Any;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{Collector, CollectorOutput};
use crate::domain::{Change, FailureKind, Job, JobStatus};

use super::cascade::CascadeFactory;
use super::error::{CoreError, CoreResult};
use super::review::ReviewEngine;
use super::store::JobStore;

/// Answer to a start request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Jobs still waiting after this request
    pub pending_count: usize,
}

impl StartOutcome {
    pub const ALREADY_RUNNING: &'static str = "already running";
    pub const NO_PENDING: &'static str = "no pending jobs";

    fn started(job_id: Uuid, pending_count: usize) -> Self {
        Self {
            started: true,
            job_id: Some(job_id),
            reason: None,
            pending_count,
        }
    }

    fn refused(reason: &str, pending_count: usize) -> Self {
        Self {
            started: false,
            job_id: None,
            reason: Some(reason.to_string()),
            pending_count,
        }
    }
}

/// Claims jobs and runs them through a collector, one at a time
#[derive(Clone)]
pub struct Executor {
    store: JobStore,
    collector: Arc<dyn Collector>,
    review: ReviewEngine,
}

impl Executor {
    pub fn new(store: JobStore, collector: Arc<dyn Collector>, review: ReviewEngine) -> Self {
        Self {
            store,
            collector,
            review,
        }
    }

    /// Claim the next eligible job and dispatch it.
    ///
    /// Returns as soon as the job is running; execution continues on the
    /// tokio runtime. Must be called from within a runtime.
    pub fn start_next(&self) -> CoreResult<StartOutcome> {
        self.start_next_tracked().map(|(outcome, _)| outcome)
    }

    /// Like [`start_next`](Self::start_next), also returning the handle of
    /// the dispatched execution
    #[instrument(skip(self))]
    pub fn start_next_tracked(&self) -> CoreResult<(StartOutcome, Option<JoinHandle<()>>)> {
        loop {
            if let Some(running) = self.store.find_running()? {
                debug!(running = %running.id, "Start refused; a job is already running");
                let pending = self.store.count_jobs(JobStatus::Pending)?;
                return Ok((StartOutcome::refused(StartOutcome::ALREADY_RUNNING, pending), None));
            }

            let Some(mut job) = self.store.next_pending()? else {
                return Ok((StartOutcome::refused(StartOutcome::NO_PENDING, 0), None));
            };

            let now = Utc::now();
            if !self.store.claim(job.id, now)? {
                // Another caller claimed first
                debug!(job_id = %job.id, "Lost claim race, retrying");
                continue;
            }

            job.status = JobStatus::Running;
            job.started_at = Some(now);

            let pending = self.store.count_jobs(JobStatus::Pending)?;
            info!(
                job_id = %job.id,
                entity_type = %job.entity_type,
                job_type = job.job_type.as_str(),
                priority = job.priority,
                "Job started"
            );

            let job_id = job.id;
            let executor = self.clone();
            let handle = tokio::spawn(async move { executor.execute(job).await });
            return Ok((StartOutcome::started(job_id, pending), Some(handle)));
        }
    }

    /// Run the collector and settle the job; never returns an error
    async fn execute(self, job: Job) {
        let job_id = job.id;
        let collector = Arc::clone(&self.collector);
        let input = job.clone();

        // Inner task so a collector panic surfaces as a JoinError
        let result = tokio::spawn(async move { collector.run(&input).await }).await;

        let failure = match result {
            Ok(Ok(output)) => match self.record(&job, output) {
                Ok(()) => return,
                Err(e) => format!("failed to record results: {}", e),
            },
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => {
                format!("collector panicked: {}", panic_message(e.into_panic()))
            }
            Err(e) => format!("collector task aborted: {}", e),
        };

        error!(%job_id, collector = self.collector.name(), error = %failure, "Job failed");
        match self
            .store
            .fail(job_id, FailureKind::Execution, &failure, Utc::now())
        {
            Ok(true) => {}
            Ok(false) => warn!(%job_id, "Job no longer running; failure not recorded"),
            Err(e) => error!(%job_id, error = %e, "Failed to record job failure"),
        }
    }

    /// Persist collector output, complete the job, then review the change
    fn record(&self, job: &Job, output: CollectorOutput) -> CoreResult<()> {
        let change = match output.change {
            Some(mut proposal) => {
                if proposal.entity_id.is_none() {
                    proposal.entity_id = job.entity_id;
                }
                if proposal.data.entity_type() != job.entity_type {
                    return Err(CoreError::Validation(format!(
                        "collector proposed a {} for a {} job",
                        proposal.data.entity_type(),
                        job.entity_type
                    )));
                }
                let change = Change::from_proposal(Some(job.id), proposal, job.parent_ref)
                    .map_err(CoreError::Validation)?;
                Some(change)
            }
            None => None,
        };

        let cascade = CascadeFactory::new(self.store.clone()).plan(
            job,
            change.as_ref().map(|c| c.id),
            output.cascade,
        )?;

        if !self
            .store
            .complete_with_results(job.id, change.as_ref(), &cascade, Utc::now())?
        {
            warn!(job_id = %job.id, "Job no longer running; discarding collector results");
            return Ok(());
        }

        info!(
            job_id = %job.id,
            change = change.is_some(),
            cascade_jobs = cascade.len(),
            "Job completed"
        );

        if let Some(change) = change {
            match self.review.auto_review(change.id) {
                Ok(outcome) => debug!(job_id = %job.id, change_id = %change.id, ?outcome, "Change reviewed"),
                Err(e) => warn!(job_id = %job.id, change_id = %change.id, error = %e, "Auto-review failed"),
            }
        }

        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
