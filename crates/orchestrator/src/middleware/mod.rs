//! Composable middleware around capability invocation.
//!
//! Every dispatch flows through the same ordered stack: the planning ledger
//! records it, the memory stage loads and persists durable notes, the
//! compaction stage keeps the assembled context inside its token budget,
//! and the approval gate parks requests that need a human decision. The
//! stack ends at an `Invoker`, which actually runs the capability.

mod compaction;
mod gate;
mod ledger;
mod memory;

pub use compaction::CompactionMiddleware;
pub use gate::{ApprovalCoordinator, ApprovalDecision, GateMiddleware};
pub use ledger::{DispatchLedger, DispatchState, LedgerMiddleware};
pub use memory::MemoryMiddleware;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::request::{ExecutionRequest, ExecutionResult};

/// Terminal stage of the pipeline: runs the capability itself.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        request: &ExecutionRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionResult, DispatchError>;
}

/// One stage in the dispatch pipeline. Stages wrap the rest of the stack
/// through `next`, so they can act before and after the invocation.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        request: ExecutionRequest,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<ExecutionResult, DispatchError>;
}

/// Remainder of the pipeline from the current stage onward.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    invoker: &'a dyn Invoker,
}

impl<'a> Next<'a> {
    pub fn new(stack: &'a [Arc<dyn Middleware>], invoker: &'a dyn Invoker) -> Self {
        Self {
            rest: stack,
            invoker,
        }
    }

    pub async fn run(
        self,
        request: ExecutionRequest,
        ctx: &mut ExecutionContext,
    ) -> Result<ExecutionResult, DispatchError> {
        match self.rest.split_first() {
            Some((stage, rest)) => {
                stage
                    .handle(
                        request,
                        ctx,
                        Next {
                            rest,
                            invoker: self.invoker,
                        },
                    )
                    .await
            }
            None => self.invoker.invoke(&request, ctx).await,
        }
    }
}
