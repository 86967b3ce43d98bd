//! Collector interfaces.
//!
//! A collector turns a job into a proposed change and/or requests for
//! follow-on jobs. The search and extraction logic itself lives outside
//! this crate; collectors here only bridge to it.

pub mod command;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::cascade::CascadeRequest;
use crate::domain::{Job, ProposedChange};

// Re-export the subprocess collector
pub use command::CommandCollector;

/// Output from a collector run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorOutput {
    /// Proposed create/update of the job's target entity
    #[serde(default)]
    pub change: Option<ProposedChange>,

    /// Related entities discovered along the way
    #[serde(default, alias = "cascadeRequests")]
    pub cascade: Vec<CascadeRequest>,
}

impl CollectorOutput {
    pub fn with_change(change: ProposedChange) -> Self {
        Self {
            change: Some(change),
            cascade: Vec::new(),
        }
    }

    pub fn and_cascade(mut self, request: CascadeRequest) -> Self {
        self.cascade.push(request);
        self
    }
}

/// Collector failure.
///
/// Both kinds fail the job; they differ only in the stored message.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Transient: rate limits, timeouts, flaky upstreams
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// Permanent: bad parameters, unparseable output
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

/// Trait for collection backends
#[async_trait]
pub trait Collector: Send + Sync {
    /// Human-readable collector name
    fn name(&self) -> &str;

    /// Run collection for a job
    async fn run(&self, job: &Job) -> Result<CollectorOutput, CollectorError>;
}
