//! Error taxonomy for the orchestration core.
//!
//! Collector failures and reaper timeouts are not returned to callers; they
//! are recorded on the job as a [`FailureKind`](crate::domain::FailureKind).
//! An "already running" refusal is a normal [`StartOutcome`](super::StartOutcome).

use thiserror::Error;
use uuid::Uuid;

use super::store::StoreError;

/// Errors surfaced by the control surface
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed creation parameters or a payload that fails its schema
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Job {0} is running and cannot be deleted")]
    JobRunning(Uuid),

    /// A referenced pending change or committed entity could not be resolved
    #[error("Linkage error: {0}")]
    Linkage(String),

    #[error("Invalid transition for {id}: {from} → {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

impl CoreError {
    pub fn job_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "Job", id }
    }

    pub fn change_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "Change", id }
    }

    pub fn entity_not_found(id: Uuid) -> Self {
        Self::NotFound { kind: "Entity", id }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
