//! Proposed entity changes awaiting review.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{EntityType, ParentRef, ProposedData};

/// A proposed create or update of an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: Uuid,

    /// Job whose collector run produced this change
    pub job_id: Option<Uuid>,

    pub entity_type: EntityType,

    /// Target entity; set up front for updates, filled in on commit for creations
    pub entity_id: Option<Uuid>,

    pub proposed_data: ProposedData,

    /// Collector-estimated probability the proposal is correct, in [0, 1]
    pub confidence: f64,

    /// Parent the entity will be linked to on commit
    pub parent_ref: Option<ParentRef>,

    pub status: ChangeStatus,

    pub review_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl Change {
    /// Build a pending change from a collector proposal.
    ///
    /// Fails when the confidence is outside [0, 1] or the payload's entity
    /// type disagrees with the declared one.
    pub fn from_proposal(
        job_id: Option<Uuid>,
        proposal: ProposedChange,
        parent_ref: Option<ParentRef>,
    ) -> Result<Self, String> {
        if !proposal.confidence.is_finite() || !(0.0..=1.0).contains(&proposal.confidence) {
            return Err(format!(
                "confidence must be within [0, 1], got {}",
                proposal.confidence
            ));
        }

        let entity_type = proposal.data.entity_type();
        if let Some(declared) = proposal.entity_type {
            if declared != entity_type {
                return Err(format!(
                    "change declares entity type {} but carries a {} payload",
                    declared, entity_type
                ));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            job_id,
            entity_type,
            entity_id: proposal.entity_id,
            proposed_data: proposal.data,
            confidence: proposal.confidence,
            parent_ref,
            status: ChangeStatus::Pending,
            review_note: None,
            created_at: Utc::now(),
            reviewed_at: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == ChangeStatus::Pending
    }
}

/// A change as emitted by a collector, before it is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedChange {
    #[serde(default)]
    pub entity_type: Option<EntityType>,

    /// Existing entity to update, if any
    #[serde(default)]
    pub entity_id: Option<Uuid>,

    pub data: ProposedData,

    pub confidence: f64,
}

impl ProposedChange {
    pub fn new(data: ProposedData, confidence: f64) -> Self {
        Self {
            entity_type: Some(data.entity_type()),
            entity_id: None,
            data,
            confidence,
        }
    }

    pub fn for_entity(mut self, entity_id: Uuid) -> Self {
        self.entity_id = Some(entity_id);
        self
    }
}

/// Review status of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Approved,
    Rejected,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown change status '{}'", other)),
        }
    }
}

/// A reviewer's decision on a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    Approve,
    Reject { reason: Option<String> },
}
