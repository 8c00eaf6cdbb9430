use thiserror::Error;
use uuid::Uuid;

/// Why a single dispatch did not produce a successful result.
///
/// These travel in-band inside `ExecutionResult::Failure`; the dispatcher
/// never surfaces them as out-of-band errors to the scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    #[error("context budget exceeded: estimated {estimated} tokens, limit {limit}")]
    BudgetExceeded { estimated: usize, limit: usize },

    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("capability produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("approval rejected for request {0}")]
    ApprovalRejected(Uuid),

    #[error("store failure during dispatch: {0}")]
    Store(String),
}

impl DispatchError {
    /// Transient failures that the retry policy may re-attempt. Rejection,
    /// cancellation, bad output, and budget overruns are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::CapabilityUnavailable(_) | Self::Store(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid state transition: {0}")]
    State(#[from] coach_core::StateError),

    #[error("Graph error: {0}")]
    Graph(#[from] coach_core::GraphError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Capability already registered: {0}")]
    CapabilityExists(String),

    #[error("No capability registered under name: {0}")]
    CapabilityMissing(String),

    #[error("No pending approval for request: {0}")]
    ApprovalNotFound(Uuid),

    #[error("Unit {unit_id} has no question to answer")]
    NotAQuestion { unit_id: String },

    #[error("{in_flight} dispatches still in flight for session {session_id}")]
    IncompleteDispatch { session_id: Uuid, in_flight: usize },

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DispatchError::Timeout {
            elapsed_ms: 100,
            budget_ms: 100
        }
        .is_retryable());
        assert!(DispatchError::CapabilityUnavailable("tutor".into()).is_retryable());

        assert!(!DispatchError::Cancelled.is_retryable());
        assert!(!DispatchError::ApprovalRejected(Uuid::new_v4()).is_retryable());
        assert!(!DispatchError::InvalidOutput("empty".into()).is_retryable());
        assert!(!DispatchError::BudgetExceeded {
            estimated: 10,
            limit: 5
        }
        .is_retryable());
    }
}
