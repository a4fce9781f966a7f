//! The seam between reconcilers and whatever delivers their work.

use std::fmt;

use docbot_core::ObjectKey;

use crate::error::SyncError;

/// What one reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The tracked resource no longer exists.
    Deleted,
    /// `spec.commitID` is still empty.
    WaitingForCommit,
    /// The resource cannot progress until its spec changes.
    Skipped { reason: String },
    /// Workload created.
    Created,
    /// Workload arguments brought back in line with the tracked commit.
    Updated,
    /// Preview link and served commit written to the tracked resource.
    StatusUpdated,
    /// Head commit written to `spec.commitID`.
    CommitResolved { commit: String },
    /// Already converged; no writes.
    Unchanged,
}

impl Outcome {
    /// `true` when the pass wrote to the store.
    pub fn mutated(&self) -> bool {
        matches!(
            self,
            Outcome::Created
                | Outcome::Updated
                | Outcome::StatusUpdated
                | Outcome::CommitResolved { .. }
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Deleted => write!(f, "deleted"),
            Outcome::WaitingForCommit => write!(f, "waiting-for-commit"),
            Outcome::Skipped { reason } => write!(f, "skipped ({reason})"),
            Outcome::Created => write!(f, "created"),
            Outcome::Updated => write!(f, "updated"),
            Outcome::StatusUpdated => write!(f, "status-updated"),
            Outcome::CommitResolved { commit } => write!(f, "commit-resolved ({commit})"),
            Outcome::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// One reconcile pass for one tracked pull request key.
///
/// Implementations read fresh state on every call and return errors rather
/// than retrying; the caller owns redelivery and backoff.
pub trait Reconcile: Send + Sync + 'static {
    /// Controller name used in logs and status.
    fn name(&self) -> &'static str;

    fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, SyncError>;
}
