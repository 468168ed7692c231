//! Typed errors crossing the engine boundary.
//!
//! Backends and handlers use `anyhow::Result` as internal transport;
//! [`QueueError`] is what admission and query operations return to callers,
//! pattern-matchable so the HTTP edge can map each kind to a status code.

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Error taxonomy of the queue's public operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed request or field out of range. Nothing was persisted.
    #[error("{0}")]
    Validation(String),

    /// The requested dependency edge would close a cycle.
    #[error("circular dependency detected")]
    CycleDetected,

    /// A declared parent job does not exist.
    #[error("dependency job {0} not found")]
    UnknownDependency(Uuid),

    /// Job id unknown.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// Operation is not valid from the job's current state.
    #[error("{reason}")]
    StateConflict { status: JobStatus, reason: String },

    /// Shared store unavailable after bounded internal retries.
    #[error("store temporarily unavailable: {0}")]
    TransientStore(#[source] anyhow::Error),

    /// Invariant violation or unexpected backend failure.
    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl QueueError {
    /// Reject a cancel from a state that does not allow it, with the
    /// state-specific wording surfaced to callers.
    pub fn cancel_conflict(status: JobStatus) -> Self {
        let reason = match status {
            JobStatus::Completed => "Cannot cancel completed job".to_string(),
            JobStatus::Running => "Cannot cancel running job".to_string(),
            JobStatus::Cancelled => "Job already cancelled".to_string(),
            other => format!("Cannot cancel job in state {other}"),
        };
        QueueError::StateConflict { status, reason }
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_conflict_wording_is_state_specific() {
        let err = QueueError::cancel_conflict(JobStatus::Running);
        assert_eq!(err.to_string(), "Cannot cancel running job");

        let err = QueueError::cancel_conflict(JobStatus::Cancelled);
        assert_eq!(err.to_string(), "Job already cancelled");
    }

    #[test]
    fn anyhow_converts_to_internal() {
        let err: QueueError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, QueueError::Internal(_)));
    }
}
