//! Collection jobs and their lifecycle.
//!
//! A Job is one unit of discovery or update work targeting a single entity.
//! Status moves strictly forward: pending → running → completed | failed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{EntityType, ParentRef};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_SEARCH_QUERY_LEN: usize = 500;

/// A collection job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job
    pub id: Uuid,

    /// Kind of entity the job targets
    pub entity_type: EntityType,

    /// Existing entity being updated (or filled in once this job's change commits)
    pub entity_id: Option<Uuid>,

    pub job_type: JobType,

    /// Link to the parent entity, possibly still a pending change
    pub parent_ref: Option<ParentRef>,

    pub status: JobStatus,

    /// 1 (lowest) to 10 (highest)
    pub priority: u8,

    /// Opaque collector parameters
    pub search_query: Option<String>,
    pub search_filters: Option<serde_json::Value>,

    /// Denormalized context kept for manual relinking
    pub context: Option<JobContext>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,

    /// Number of times the reaper force-failed this job
    pub reset_count: u32,

    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build a pending job from validated creation parameters
    pub fn from_new(new: NewJob) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            job_type: new.job_type,
            parent_ref: new.parent_ref,
            status: JobStatus::Pending,
            priority: new.priority,
            search_query: new.search_query,
            search_filters: new.search_filters,
            context: new.context,
            started_at: None,
            completed_at: None,
            error_message: None,
            failure_kind: None,
            reset_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time spent running, if the job has started
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or(now) - started)
    }
}

/// Parameters for creating a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub entity_type: EntityType,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub entity_id: Option<Uuid>,
    #[serde(default)]
    pub parent_ref: Option<ParentRef>,
    #[serde(default)]
    pub search_query: Option<String>,
    #[serde(default)]
    pub search_filters: Option<serde_json::Value>,
    #[serde(default)]
    pub context: Option<JobContext>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            entity_type: EntityType::Community,
            job_type: JobType::Discovery,
            priority: DEFAULT_PRIORITY,
            entity_id: None,
            parent_ref: None,
            search_query: None,
            search_filters: None,
            context: None,
        }
    }
}

impl NewJob {
    /// A discovery job for the given search query
    pub fn discovery(entity_type: EntityType, search_query: impl Into<String>) -> Self {
        Self {
            entity_type,
            search_query: Some(search_query.into()),
            ..Default::default()
        }
    }

    /// An update job for an existing entity
    pub fn update(entity_type: EntityType, entity_id: Uuid) -> Self {
        Self {
            entity_type,
            job_type: JobType::Update,
            entity_id: Some(entity_id),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent_ref = Some(parent);
        self
    }

    /// Validate creation parameters before anything is persisted
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(format!(
                "priority must be between {} and {}, got {}",
                MIN_PRIORITY, MAX_PRIORITY, self.priority
            ));
        }

        if let Some(query) = &self.search_query {
            if query.trim().is_empty() {
                return Err("search_query must not be blank".to_string());
            }
            if query.len() > MAX_SEARCH_QUERY_LEN {
                return Err(format!(
                    "search_query exceeds {} characters",
                    MAX_SEARCH_QUERY_LEN
                ));
            }
        }

        if let Some(filters) = &self.search_filters {
            if !filters.is_object() {
                return Err("search_filters must be a JSON object".to_string());
            }
        }

        match self.job_type {
            JobType::Discovery => {
                if self.search_query.is_none() && self.context.is_none() {
                    return Err("discovery jobs need a search_query or context".to_string());
                }
            }
            JobType::Update => {
                if self.entity_id.is_none() {
                    return Err("update jobs need an entity_id".to_string());
                }
            }
            JobType::Inventory => {
                if self.entity_id.is_none() {
                    return Err("inventory jobs need an entity_id".to_string());
                }
                if !matches!(self.entity_type, EntityType::Community | EntityType::Builder) {
                    return Err(format!(
                        "inventory jobs target communities or builders, not {}",
                        self.entity_type
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Name and location of the entity a cascade job was spawned for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Kind of collection work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Find new entities
    Discovery,

    /// Refresh an existing entity
    Update,

    /// Enumerate properties under a community or builder
    Inventory,
}

impl Default for JobType {
    fn default() -> Self {
        Self::Discovery
    }
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Update => "update",
            Self::Inventory => "inventory",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(Self::Discovery),
            "update" => Ok(Self::Update),
            "inventory" => Ok(Self::Inventory),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self → next` is an allowed transition
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Why a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The collector (or recording its output) failed
    Execution,

    /// The reaper force-failed a job that ran past the timeout
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Timeout => "timeout",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execution" => Ok(Self::Execution),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}
