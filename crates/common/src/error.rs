use thiserror::Error;

use crate::ids::{FetchPhaseId, JobId};

/// Canonical error taxonomy shared by planner, coordinator, and node crates.
///
/// Classification guidance:
/// - [`DfqError::Planning`] / [`DfqError::PlanningInconsistency`]: discovered while
///   compiling a query; never reach execution
/// - [`DfqError::ContextNotFound`] / [`DfqError::Resolution`]: fail one node's
///   contribution to a fetch phase
/// - [`DfqError::Transport`] / [`DfqError::Overloaded`]: delivery problems; the job
///   layer above a single fetch phase decides whether to retry
#[derive(Debug, Error)]
pub enum DfqError {
    /// Invalid or inconsistent configuration/environment state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Query planning failures caused by the query itself (unknown column, bad type).
    #[error("planning error: {0}")]
    Planning(String),

    /// A fetch reference or fetch source invariant was violated during push-down.
    ///
    /// This is an upstream contract violation, not a user error. Fatal for the
    /// query being compiled and never retried.
    #[error("planning inconsistency: {0}")]
    PlanningInconsistency(String),

    /// A resolve request targeted a (job, fetch phase) that was already closed
    /// or never opened on this node.
    #[error("fetch context not found for job {job_id} fetch phase {fetch_phase_id}")]
    ContextNotFound {
        /// Job the request belonged to.
        job_id: JobId,
        /// Fetch phase within the job.
        fetch_phase_id: FetchPhaseId,
    },

    /// The underlying row resolver failed for one or more requested fetch ids.
    #[error("fetch resolution failed: {0}")]
    Resolution(String),

    /// Node unreachable, request timed out, or the response could not be delivered.
    #[error("transport error: {0}")]
    Transport(String),

    /// A sheddable request was rejected because all executor slots were taken.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Runtime failures after planning succeeded (decode errors, shape mismatches).
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for behavior that is intentionally not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DfqError {
    /// Whether the job layer may retry the failed request as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Overloaded(_))
    }
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, DfqError>;

#[cfg(test)]
mod tests {
    use super::DfqError;
    use crate::ids::{FetchPhaseId, JobId};

    #[test]
    fn only_delivery_failures_are_retryable() {
        assert!(DfqError::Transport("timeout".to_string()).is_retryable());
        assert!(DfqError::Overloaded("slots".to_string()).is_retryable());
        assert!(!DfqError::PlanningInconsistency("x".to_string()).is_retryable());
        assert!(!DfqError::Resolution("x".to_string()).is_retryable());
        assert!(
            !DfqError::ContextNotFound {
                job_id: JobId(1),
                fetch_phase_id: FetchPhaseId(2),
            }
            .is_retryable()
        );
    }

    #[test]
    fn context_not_found_names_job_and_phase() {
        let err = DfqError::ContextNotFound {
            job_id: JobId(7),
            fetch_phase_id: FetchPhaseId(3),
        };
        assert_eq!(
            err.to_string(),
            "fetch context not found for job 7 fetch phase 3"
        );
    }
}
