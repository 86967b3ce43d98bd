//! Core orchestration logic.
//!
//! This module contains:
//! - JobStore: SQLite persistence with atomic conditional transitions
//! - Ledger: changes, committed entities, and linkage resolution
//! - Executor: single-flight job execution
//! - Reaper: periodic failure of stuck jobs
//! - Cascade: follow-on jobs for discovered entities
//! - Review: confidence-gated change approval
//! - Orchestrator: the control surface tying these together

pub mod cascade;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod reaper;
pub mod review;
pub mod store;

// Re-export commonly used types
pub use cascade::{CascadeFactory, CascadeRequest};
pub use error::{CoreError, CoreResult};
pub use executor::{Executor, StartOutcome};
pub use ledger::{CommitReceipt, StrandedDependent};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use reaper::{Reaper, ReaperConfig};
pub use review::{
    HoldReason, ReviewEngine, ReviewOutcome, ReviewSummary, DEFAULT_APPROVAL_THRESHOLD,
};
pub use store::{DeleteOutcome, JobFilter, JobStats, JobStore, StoreError};
