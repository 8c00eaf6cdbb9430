//! Dispatcher: runs one execution request through the middleware stack and
//! the capability, enforcing budgets, cancellation, and the retry policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::CapabilityRegistry;
use crate::config::{OrchestratorConfig, RetryPolicy};
use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::middleware::{Invoker, Middleware, Next};
use crate::request::{ExecutionRequest, ExecutionResult};

/// Terminal invoker: budget check, capability lookup, timed invocation,
/// output validation.
struct CapabilityInvoker {
    registry: CapabilityRegistry,
}

#[async_trait]
impl Invoker for CapabilityInvoker {
    async fn invoke(
        &self,
        request: &ExecutionRequest,
        ctx: &mut ExecutionContext,
    ) -> std::result::Result<ExecutionResult, DispatchError> {
        let capability = self
            .registry
            .get(&request.capability)
            .ok_or_else(|| DispatchError::CapabilityUnavailable(request.capability.clone()))?;

        // Budget check happens on the assembled input, after memory load
        // and compaction have had their say.
        let estimated = ctx.estimated_tokens(&request.payload);
        if estimated > request.budget.max_context_tokens {
            return Err(DispatchError::BudgetExceeded {
                estimated,
                limit: request.budget.max_context_tokens,
            });
        }

        let budget_ms = request.budget.max_duration.as_millis() as u64;
        let started = std::time::Instant::now();
        let cancellation = ctx.cancellation().clone();

        let output = tokio::select! {
            _ = cancellation.cancelled() => return Err(DispatchError::Cancelled),
            outcome = tokio::time::timeout(request.budget.max_duration, capability.invoke(request, ctx)) => {
                match outcome {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(DispatchError::Timeout {
                            elapsed_ms: started.elapsed().as_millis() as u64,
                            budget_ms,
                        })
                    }
                }
            }
        };

        capability.validate_output(&output)?;

        Ok(ExecutionResult::Success {
            payload: output.payload,
            note: output.note,
        })
    }
}

/// Dispatches execution requests through the middleware pipeline.
///
/// `dispatch` never returns an out-of-band error: every failure mode is
/// folded into `ExecutionResult::Failure`, so schedulers can treat the
/// result of a batch uniformly.
pub struct Dispatcher {
    stack: Vec<Arc<dyn Middleware>>,
    invoker: CapabilityInvoker,
    retry: RetryPolicy,
    cancellation: CancellationToken,
    /// Per-session children of the root token, so cancelling one session
    /// leaves the others' in-flight dispatches alone.
    session_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Dispatcher {
    pub fn new(
        registry: CapabilityRegistry,
        stack: Vec<Arc<dyn Middleware>>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            stack,
            invoker: CapabilityInvoker { registry },
            retry: config.retry.clone(),
            cancellation: CancellationToken::new(),
            session_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Token that cancels all in-flight and future dispatches when fired.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.invoker.registry
    }

    fn session_token(&self, session_id: Uuid) -> CancellationToken {
        self.session_tokens
            .lock()
            .unwrap()
            .entry(session_id)
            .or_insert_with(|| self.cancellation.child_token())
            .clone()
    }

    /// Cancel every in-flight and future dispatch for one session. Other
    /// sessions are untouched.
    pub fn cancel_session(&self, session_id: Uuid) {
        let token = self.session_token(session_id);
        token.cancel();
    }

    /// Run one request to a settled result, retrying transient failures
    /// under the retry policy.
    pub async fn dispatch(&self, request: ExecutionRequest) -> ExecutionResult {
        let token = self.session_token(request.session_id);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.dispatch_once(&request, attempt, &token).await {
                Ok(result) => return result,
                Err(error) => {
                    let retries_left = self.retry.max_retries.saturating_sub(attempt - 1);
                    if error.is_retryable() && retries_left > 0 {
                        let delay = self.retry.delay_for(attempt - 1);
                        warn!(
                            session_id = %request.session_id,
                            unit_id = %request.unit_id,
                            attempt,
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            "Dispatch failed, retrying"
                        );
                        // Backoff is a cancellable suspension point.
                        tokio::select! {
                            _ = token.cancelled() => {
                                return ExecutionResult::Failure(DispatchError::Cancelled)
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    info!(
                        session_id = %request.session_id,
                        unit_id = %request.unit_id,
                        attempt,
                        error = %error,
                        "Dispatch failed terminally"
                    );
                    return ExecutionResult::Failure(error);
                }
            }
        }
    }

    async fn dispatch_once(
        &self,
        request: &ExecutionRequest,
        attempt: u32,
        token: &CancellationToken,
    ) -> std::result::Result<ExecutionResult, DispatchError> {
        if token.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let tools = self
            .invoker
            .registry
            .get(&request.capability)
            .map(|c| c.tool_allowlist())
            .unwrap_or_default();

        let mut ctx = ExecutionContext::new(request.session_id, &request.unit_id, request.budget)
            .with_attempt(attempt)
            .with_tool_allowlist(tools)
            .with_cancellation(token.child_token());

        debug!(
            session_id = %request.session_id,
            unit_id = %request.unit_id,
            capability = %request.capability,
            attempt,
            "Dispatching request"
        );

        Next::new(&self.stack, &self.invoker)
            .run(request.clone(), &mut ctx)
            .await
    }

    /// Dispatch a batch concurrently. Results come back in request order;
    /// one failed request never disturbs its neighbours.
    pub async fn dispatch_many(&self, requests: Vec<ExecutionRequest>) -> Vec<ExecutionResult> {
        join_all(requests.into_iter().map(|request| self.dispatch(request))).await
    }
}
