use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::DispatchError;
use crate::request::{ExecutionRequest, ExecutionResult};

use super::{Middleware, Next};

/// Where a unit's latest dispatch stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    InFlight,
    /// Parked on an external decision; neither settled nor failed.
    Parked,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct UnitRecord {
    state: DispatchState,
    attempts: u32,
    started_at: DateTime<Utc>,
}

/// In-memory planning ledger: one record per (session, unit) tracking the
/// current dispatch state and how many rounds the unit has consumed.
///
/// The ledger is intentionally not persisted. After a crash, progress
/// snapshots are the recovery source; in-flight entries would be stale
/// anyway. `in_flight` plus `abandon` let a supervisor reconcile.
#[derive(Default)]
pub struct DispatchLedger {
    inner: Mutex<HashMap<(Uuid, String), UnitRecord>>,
}

impl DispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a dispatch round for a unit.
    pub fn begin(&self, session_id: Uuid, unit_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .entry((session_id, unit_id.to_string()))
            .or_insert(UnitRecord {
                state: DispatchState::InFlight,
                attempts: 0,
                started_at: Utc::now(),
            });
        record.state = DispatchState::InFlight;
        record.attempts += 1;
        record.started_at = Utc::now();
    }

    /// Settle a dispatch round as completed or failed.
    pub fn finish(&self, session_id: Uuid, unit_id: &str, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.get_mut(&(session_id, unit_id.to_string())) {
            record.state = if success {
                DispatchState::Completed
            } else {
                DispatchState::Failed
            };
        }
    }

    /// Drop the in-flight marker without settling the unit. Used when a
    /// dispatch parks on approval or is reconciled after cancellation.
    pub fn abandon(&self, session_id: Uuid, unit_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.get_mut(&(session_id, unit_id.to_string())) {
            if record.state == DispatchState::InFlight {
                record.state = DispatchState::Parked;
                record.attempts = record.attempts.saturating_sub(1);
            }
        }
    }

    /// Units currently marked in flight for a session, sorted.
    pub fn in_flight(&self, session_id: Uuid) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut units: Vec<String> = inner
            .iter()
            .filter(|((sid, _), record)| *sid == session_id && record.state == DispatchState::InFlight)
            .map(|((_, unit_id), _)| unit_id.clone())
            .collect();
        units.sort();
        units
    }

    pub fn state(&self, session_id: Uuid, unit_id: &str) -> Option<DispatchState> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&(session_id, unit_id.to_string()))
            .map(|record| record.state)
    }

    /// When the unit's current round started, if one is in flight.
    pub fn in_flight_since(&self, session_id: Uuid, unit_id: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&(session_id, unit_id.to_string()))
            .filter(|record| record.state == DispatchState::InFlight)
            .map(|record| record.started_at)
    }

    /// Dispatch rounds consumed by a unit so far.
    pub fn attempts(&self, session_id: Uuid, unit_id: &str) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&(session_id, unit_id.to_string()))
            .map(|record| record.attempts)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for DispatchLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("DispatchLedger")
            .field("entries", &inner.len())
            .finish()
    }
}

/// Pipeline stage that keeps the ledger current around each dispatch.
pub struct LedgerMiddleware {
    ledger: Arc<DispatchLedger>,
}

impl LedgerMiddleware {
    pub fn new(ledger: Arc<DispatchLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Middleware for LedgerMiddleware {
    fn name(&self) -> &'static str {
        "ledger"
    }

    async fn handle(
        &self,
        request: ExecutionRequest,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<ExecutionResult, DispatchError> {
        let session_id = request.session_id;
        let unit_id = request.unit_id.clone();

        self.ledger.begin(session_id, &unit_id);
        debug!(
            session_id = %session_id,
            unit_id = %unit_id,
            attempt = self.ledger.attempts(session_id, &unit_id),
            "Dispatch recorded in ledger"
        );

        let result = next.run(request, ctx).await;

        match &result {
            Ok(ExecutionResult::Success { .. }) => {
                self.ledger.finish(session_id, &unit_id, true);
            }
            Ok(ExecutionResult::PendingApproval { .. }) => {
                // Parked, not settled; the round does not count.
                self.ledger.abandon(session_id, &unit_id);
            }
            Ok(ExecutionResult::Failure(_)) | Err(_) => {
                self.ledger.finish(session_id, &unit_id, false);
            }
        }

        result
    }
}
