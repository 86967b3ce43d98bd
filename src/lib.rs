//! landscout - Collection job orchestrator for real-estate discovery
//!
//! Runs discovery and update jobs for communities, builders, properties and
//! sales reps one at a time, and turns the changes collectors propose into
//! committed entities once they pass confidence-gated review.
//!
//! # Architecture
//!
//! The system is built around a single SQLite job store:
//! - Job status moves through atomic conditional transitions, so at most
//!   one job runs at any instant
//! - Collectors propose changes and request follow-on (cascade) jobs
//! - A child linked to a pending change is re-pointed at the committed
//!   entity in the same transaction that approves the change
//! - A background reaper fails jobs stuck past a timeout
//!
//! # Modules
//!
//! - `adapters`: Collector trait and the subprocess collector
//! - `core`: Orchestration logic (JobStore, Executor, Reaper, Review)
//! - `domain`: Data structures (Job, Change, Entity, ParentRef)
//! - `config`: Configuration discovery
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Queue a discovery job
//! landscout create community --query "Austin TX" -p 7
//!
//! # Run the next job
//! landscout start
//!
//! # Review what the collector proposed
//! landscout changes --status pending
//! landscout review <change-id> approve
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::adapters::{Collector, CollectorError, CollectorOutput, CommandCollector};
pub use crate::core::{CoreError, JobStore, Orchestrator, OrchestratorSettings, StartOutcome};
pub use crate::domain::{Change, ChangeStatus, Decision, EntityType, Job, JobStatus, NewJob, ParentRef};
