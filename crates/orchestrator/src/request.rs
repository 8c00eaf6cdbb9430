use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::error::DispatchError;

/// Per-dispatch resource limits.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    /// Wall-clock limit for the capability invocation.
    pub max_duration: Duration,
    /// Upper bound on the estimated size of the assembled input context.
    pub max_context_tokens: usize,
}

impl Budget {
    pub fn new(max_duration: Duration, max_context_tokens: usize) -> Self {
        Self {
            max_duration,
            max_context_tokens,
        }
    }
}

/// One unit of work handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: Uuid,
    pub session_id: Uuid,
    pub unit_id: String,
    /// Name of the capability that should execute this request.
    pub capability: String,
    /// Capability-specific input.
    pub payload: Value,
    pub budget: Budget,
    pub requires_approval: bool,
}

impl ExecutionRequest {
    pub fn new(
        session_id: Uuid,
        unit_id: impl Into<String>,
        capability: impl Into<String>,
        payload: Value,
        budget: Budget,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            session_id,
            unit_id: unit_id.into(),
            capability: capability.into(),
            payload,
            budget,
            requires_approval: false,
        }
    }

    pub fn with_approval_required(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// Outcome of one dispatch. Failures travel in-band; a pending approval is
/// not a failure, it parks the request until a decision arrives.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    Success {
        payload: Value,
        /// Durable note emitted by the capability, if any.
        note: Option<String>,
    },
    Failure(DispatchError),
    PendingApproval { request_id: Uuid },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure(&self) -> Option<&DispatchError> {
        match self {
            Self::Failure(error) => Some(error),
            _ => None,
        }
    }
}

/// Rough token estimate used for budget checks and compaction decisions.
/// Whitespace-separated words are close enough for limit enforcement.
pub fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request = ExecutionRequest::new(
            Uuid::new_v4(),
            "u1",
            "tutor",
            json!({"prompt": "explain"}),
            Budget::new(Duration::from_secs(30), 1000),
        );

        assert!(!request.requires_approval);
        assert!(request.with_approval_required().requires_approval);
    }

    #[test]
    fn test_result_accessors() {
        let ok = ExecutionResult::Success {
            payload: json!({}),
            note: None,
        };
        assert!(ok.is_success());
        assert!(ok.failure().is_none());

        let failed = ExecutionResult::Failure(DispatchError::Cancelled);
        assert!(!failed.is_success());
        assert_eq!(failed.failure(), Some(&DispatchError::Cancelled));
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("the dispatch loop retries"), 4);
    }
}
