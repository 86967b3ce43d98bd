//! Domain types for the collection orchestrator.
//!
//! This module contains the core data structures:
//! - Job: a unit of collection work and its status
//! - Change: a proposed entity create/update awaiting review
//! - Entity: entity kinds, payloads, and parent references

pub mod change;
pub mod entity;
pub mod job;

// Re-export commonly used types
pub use change::{Change, ChangeStatus, Decision, ProposedChange};
pub use entity::{
    BuilderData, CommunityData, Entity, EntityType, ParentRef, PropertyData, ProposedData,
    SalesRepData,
};
pub use job::{
    FailureKind, Job, JobContext, JobStatus, JobType, NewJob, DEFAULT_PRIORITY, MAX_PRIORITY,
    MAX_SEARCH_QUERY_LEN, MIN_PRIORITY,
};
