//! Confidence-gated change review.
//!
//! A pending change is committed automatically when its confidence reaches
//! the approval threshold and its parent is resolvable. Committing a change
//! resolves the references held by its dependents, and any dependent change
//! that becomes resolvable is reviewed in the same pass.

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Change, ChangeStatus, Decision, ParentRef};

use super::error::{CoreError, CoreResult};
use super::ledger::CommitReceipt;
use super::store::JobStore;

/// Default minimum confidence for automatic approval
pub const DEFAULT_APPROVAL_THRESHOLD: f64 = 0.75;

/// Why a change was left pending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HoldReason {
    BelowThreshold { confidence: f64, threshold: f64 },

    /// The parent change has not been approved yet
    AwaitingParent { change_id: Uuid },

    /// The parent reference cannot be resolved (rejected or missing)
    Unlinked { detail: String },
}

impl std::fmt::Display for HoldReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BelowThreshold {
                confidence,
                threshold,
            } => write!(f, "confidence {:.2} below threshold {:.2}", confidence, threshold),
            Self::AwaitingParent { change_id } => {
                write!(f, "awaiting approval of parent change {}", change_id)
            }
            Self::Unlinked { detail } => write!(f, "unlinked: {}", detail),
        }
    }
}

/// Result of reviewing one change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approved {
        receipt: CommitReceipt,
        /// Dependent changes approved in the same pass
        cascaded: Vec<Uuid>,
    },
    Rejected {
        /// Jobs and changes left pointing at the rejected change
        stranded: usize,
    },
    Held(HoldReason),
    AlreadyReviewed {
        status: ChangeStatus,
    },
}

impl ReviewOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

/// Tally of a review pass over all pending changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub examined: usize,
    pub approved: usize,
    pub held: usize,
    pub errors: usize,
}

enum Parent {
    Ready(Option<Uuid>),
    Hold(HoldReason),
}

/// Reviews pending changes against the approval threshold
#[derive(Clone)]
pub struct ReviewEngine {
    store: JobStore,
    threshold: f64,
}

impl ReviewEngine {
    pub fn new(store: JobStore, threshold: f64) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Review a change against the threshold, committing it when eligible
    #[instrument(skip(self))]
    pub fn auto_review(&self, change_id: Uuid) -> CoreResult<ReviewOutcome> {
        let change = self.load(change_id)?;
        if !change.is_pending() {
            return Ok(ReviewOutcome::AlreadyReviewed {
                status: change.status,
            });
        }

        match self.try_auto_approve(&change)? {
            Err(reason) => {
                debug!(%change_id, %reason, "Change held for review");
                Ok(ReviewOutcome::Held(reason))
            }
            Ok(receipt) => {
                let cascaded = self.drain_dependents(&receipt.changes_relinked);
                Ok(ReviewOutcome::Approved { receipt, cascaded })
            }
        }
    }

    /// Apply an operator decision.
    ///
    /// Approval bypasses the threshold but never creates an orphan: it is
    /// refused while the parent change is unapproved or unresolvable.
    #[instrument(skip(self))]
    pub fn review(&self, change_id: Uuid, decision: Decision) -> CoreResult<ReviewOutcome> {
        let change = self.load(change_id)?;
        let now = Utc::now();

        match decision {
            Decision::Approve => {
                if !change.is_pending() {
                    return Err(CoreError::InvalidTransition {
                        id: change_id,
                        from: change.status.to_string(),
                        to: ChangeStatus::Approved.to_string(),
                    });
                }

                let parent = match self.resolve_parent(&change)? {
                    Parent::Ready(parent) => parent,
                    Parent::Hold(reason) => {
                        warn!(%change_id, %reason, "Manual approval refused");
                        return Err(CoreError::Linkage(format!(
                            "cannot approve change {}: {}",
                            change_id, reason
                        )));
                    }
                };

                let receipt =
                    self.store
                        .commit_change(change_id, parent, Some("approved manually"), now)?;
                info!(%change_id, entity_id = %receipt.entity_id, "Change approved manually");
                let cascaded = self.drain_dependents(&receipt.changes_relinked);
                Ok(ReviewOutcome::Approved { receipt, cascaded })
            }
            Decision::Reject { reason } => {
                let stranded = self.store.reject_change(change_id, reason.as_deref(), now)?;
                if stranded > 0 {
                    warn!(%change_id, stranded, "Rejected change leaves dependents stranded");
                } else {
                    info!(%change_id, "Change rejected");
                }
                Ok(ReviewOutcome::Rejected { stranded })
            }
        }
    }

    /// Auto-review every pending change, oldest first
    pub fn review_pending(&self) -> CoreResult<ReviewSummary> {
        let pending = self.store.list_changes(Some(ChangeStatus::Pending))?;
        let mut summary = ReviewSummary::default();

        for change in pending {
            match self.auto_review(change.id) {
                // Already approved earlier in this pass as someone's dependent
                Ok(ReviewOutcome::AlreadyReviewed { .. }) => {}
                Ok(ReviewOutcome::Approved { cascaded, .. }) => {
                    summary.examined += 1 + cascaded.len();
                    summary.approved += 1 + cascaded.len();
                }
                Ok(_) => {
                    summary.examined += 1;
                    summary.held += 1;
                }
                Err(e) => {
                    warn!(change_id = %change.id, error = %e, "Auto-review failed");
                    summary.examined += 1;
                    summary.errors += 1;
                }
            }
        }

        info!(
            examined = summary.examined,
            approved = summary.approved,
            held = summary.held,
            "Review pass complete"
        );
        Ok(summary)
    }

    fn load(&self, change_id: Uuid) -> CoreResult<Change> {
        self.store
            .get_change(change_id)?
            .ok_or_else(|| CoreError::change_not_found(change_id))
    }

    /// Commit the change if it passes the threshold and its parent resolves
    fn try_auto_approve(&self, change: &Change) -> CoreResult<Result<CommitReceipt, HoldReason>> {
        if change.confidence < self.threshold {
            return Ok(Err(HoldReason::BelowThreshold {
                confidence: change.confidence,
                threshold: self.threshold,
            }));
        }

        let parent = match self.resolve_parent(change)? {
            Parent::Ready(parent) => parent,
            Parent::Hold(reason) => return Ok(Err(reason)),
        };

        let note = format!("auto-approved at confidence {:.2}", change.confidence);
        let receipt = self
            .store
            .commit_change(change.id, parent, Some(&note), Utc::now())?;
        info!(
            change_id = %change.id,
            entity_id = %receipt.entity_id,
            created = receipt.created,
            jobs_relinked = receipt.jobs_relinked,
            "Change auto-approved"
        );
        Ok(Ok(receipt))
    }

    fn resolve_parent(&self, change: &Change) -> CoreResult<Parent> {
        let parent = match change.parent_ref {
            None => Parent::Ready(None),
            Some(ParentRef::CommittedEntity(entity_id)) => {
                if self.store.entity_exists(entity_id)? {
                    Parent::Ready(Some(entity_id))
                } else {
                    Parent::Hold(HoldReason::Unlinked {
                        detail: format!("parent entity {} does not exist", entity_id),
                    })
                }
            }
            Some(ParentRef::PendingChange(parent_id)) => match self.store.get_change(parent_id)? {
                None => Parent::Hold(HoldReason::Unlinked {
                    detail: format!("parent change {} does not exist", parent_id),
                }),
                Some(parent) => match (parent.status, parent.entity_id) {
                    (ChangeStatus::Pending, _) => {
                        Parent::Hold(HoldReason::AwaitingParent {
                            change_id: parent_id,
                        })
                    }
                    (ChangeStatus::Approved, Some(entity_id)) => Parent::Ready(Some(entity_id)),
                    (ChangeStatus::Approved, None) => {
                        return Err(CoreError::Linkage(format!(
                            "approved change {} has no committed entity",
                            parent_id
                        )))
                    }
                    (ChangeStatus::Rejected, _) => Parent::Hold(HoldReason::Unlinked {
                        detail: format!("parent change {} was rejected", parent_id),
                    }),
                },
            },
        };
        Ok(parent)
    }

    /// Review dependents unblocked by a commit, transitively
    fn drain_dependents(&self, unblocked: &[Uuid]) -> Vec<Uuid> {
        let mut queue: VecDeque<Uuid> = unblocked.iter().copied().collect();
        let mut approved = Vec::new();

        while let Some(change_id) = queue.pop_front() {
            let change = match self.store.get_change(change_id) {
                Ok(Some(change)) if change.is_pending() => change,
                Ok(_) => continue,
                Err(e) => {
                    warn!(%change_id, error = %e, "Failed to load dependent change");
                    continue;
                }
            };

            match self.try_auto_approve(&change) {
                Ok(Ok(receipt)) => {
                    approved.push(change_id);
                    queue.extend(receipt.changes_relinked);
                }
                Ok(Err(reason)) => debug!(%change_id, %reason, "Dependent change held"),
                Err(e) => warn!(%change_id, error = %e, "Dependent change could not be committed"),
            }
        }

        approved
    }
}
