//! Learning-session orchestration.
//!
//! This crate schedules learning units from the dependency graph, pushes
//! each dispatch through the middleware pipeline (planning ledger, durable
//! memory, context compaction, approval gate), and drives the session state
//! machine and the tutor evaluation loop on top of the dispatcher.

pub mod capability;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod middleware;
pub mod request;
pub mod session;
pub mod tutor;

pub use capability::{Capability, CapabilityOutput, CapabilityRegistry};
pub use config::{OrchestratorConfig, RetryPolicy};
pub use context::ExecutionContext;
pub use dispatch::Dispatcher;
pub use error::{DispatchError, OrchestratorError, Result};
pub use middleware::{
    ApprovalCoordinator, ApprovalDecision, CompactionMiddleware, DispatchLedger, GateMiddleware,
    LedgerMiddleware, MemoryMiddleware, Middleware, Next,
};
pub use request::{Budget, ExecutionRequest, ExecutionResult};
pub use session::{AdvanceOutcome, NoProgressReason, SessionService};
pub use tutor::TutorService;
