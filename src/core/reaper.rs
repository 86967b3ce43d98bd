//! Stuck job reaper.
//!
//! Periodically force-fails jobs that have been running longer than the
//! configured timeout, freeing the executor's single running slot.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{JobStore, StoreError};

/// Reaper timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Running time after which a job counts as stuck
    pub timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

pub struct Reaper {
    store: JobStore,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: JobStore, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// Fail every job running longer than `timeout`; returns their ids
    pub fn sweep(&self, timeout: Duration) -> Result<Vec<Uuid>, StoreError> {
        sweep(&self.store, timeout)
    }

    /// Start the periodic sweep on the tokio runtime.
    ///
    /// The loop stops when `shutdown` flips to `true` or its sender is
    /// dropped. A failed sweep is logged and retried on the next tick.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(
                interval_secs = self.config.interval.as_secs(),
                timeout_secs = self.config.timeout.as_secs(),
                "Reaper started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep(self.config.timeout) {
                            Ok(ids) if ids.is_empty() => debug!("Reaper sweep found no stuck jobs"),
                            Ok(ids) => info!(count = ids.len(), "Reaper sweep failed stuck jobs"),
                            Err(e) => error!(error = %e, "Reaper sweep failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Reaper stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// One reaper pass over the store
pub fn sweep(store: &JobStore, timeout: Duration) -> Result<Vec<Uuid>, StoreError> {
    let now = Utc::now();
    // A cutoff before the representable range matches nothing
    let Some(cutoff) = chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
    else {
        return Ok(Vec::new());
    };
    let message = format!(
        "timed out: running longer than {} minutes",
        timeout.as_secs() / 60
    );

    let failed = store.fail_stuck(cutoff, &message, now)?;
    for id in &failed {
        warn!(job_id = %id, "Job exceeded timeout and was marked failed");
    }
    Ok(failed)
}
