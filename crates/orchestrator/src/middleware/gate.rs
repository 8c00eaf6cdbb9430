use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::{DispatchError, OrchestratorError, Result};
use crate::request::{ExecutionRequest, ExecutionResult};

use super::{Middleware, Next};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalState {
    Pending,
    Decided(ApprovalDecision),
}

/// Shared record of approval requests and human decisions.
///
/// The gate registers a pending entry the first time a guarded request
/// passes through; a decision recorded via `resolve` is picked up when the
/// same request (same request id) is dispatched again.
#[derive(Default)]
pub struct ApprovalCoordinator {
    requests: Mutex<HashMap<Uuid, ApprovalState>>,
}

impl ApprovalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_pending(&self, request_id: Uuid) {
        self.requests
            .lock()
            .unwrap()
            .entry(request_id)
            .or_insert(ApprovalState::Pending);
    }

    /// Record a human decision for a pending request.
    pub fn resolve(&self, request_id: Uuid, decision: ApprovalDecision) -> Result<()> {
        let mut requests = self.requests.lock().unwrap();
        match requests.get_mut(&request_id) {
            Some(state) => {
                *state = ApprovalState::Decided(decision);
                Ok(())
            }
            None => Err(OrchestratorError::ApprovalNotFound(request_id)),
        }
    }

    pub fn is_pending(&self, request_id: Uuid) -> bool {
        matches!(
            self.requests.lock().unwrap().get(&request_id),
            Some(ApprovalState::Pending)
        )
    }

    fn decision(&self, request_id: Uuid) -> Option<ApprovalDecision> {
        match self.requests.lock().unwrap().get(&request_id) {
            Some(ApprovalState::Decided(decision)) => Some(*decision),
            _ => None,
        }
    }

    /// Request ids still waiting on a decision, sorted for determinism.
    pub fn pending(&self) -> Vec<Uuid> {
        let requests = self.requests.lock().unwrap();
        let mut ids: Vec<Uuid> = requests
            .iter()
            .filter(|(_, state)| **state == ApprovalState::Pending)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ApprovalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalCoordinator")
            .field("pending", &self.pending().len())
            .finish()
    }
}

/// Human-approval stage.
///
/// Requests that do not require approval pass straight through. Guarded
/// requests park as `PendingApproval` until a decision exists; an approved
/// request continues down the stack, a rejected one fails terminally and
/// is never retried.
pub struct GateMiddleware {
    coordinator: Arc<ApprovalCoordinator>,
}

impl GateMiddleware {
    pub fn new(coordinator: Arc<ApprovalCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Middleware for GateMiddleware {
    fn name(&self) -> &'static str {
        "gate"
    }

    async fn handle(
        &self,
        request: ExecutionRequest,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> std::result::Result<ExecutionResult, DispatchError> {
        if !request.requires_approval {
            return next.run(request, ctx).await;
        }

        match self.coordinator.decision(request.request_id) {
            Some(ApprovalDecision::Approved) => next.run(request, ctx).await,
            Some(ApprovalDecision::Rejected) => {
                Err(DispatchError::ApprovalRejected(request.request_id))
            }
            None => {
                let request_id = request.request_id;
                self.coordinator.mark_pending(request_id);
                info!(
                    session_id = %request.session_id,
                    unit_id = %request.unit_id,
                    request_id = %request_id,
                    "Dispatch parked awaiting approval"
                );
                Ok(ExecutionResult::PendingApproval { request_id })
            }
        }
    }
}
