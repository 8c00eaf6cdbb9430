//! Session service: the scheduler that drives a learning session forward.
//!
//! Each `advance` round takes the current ready-set from the graph,
//! dispatches every ready unit concurrently, applies the settled results to
//! session state, and persists a progress snapshot. Units that park on
//! approval keep their request id, so a later round re-dispatches the very
//! same request once a decision exists.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use coach_core::{
    LearningMode, LearningRecord, LearningUnit, PrerequisiteEdge, ProjectInfo, SessionProgress,
    SessionState, SessionStatus, UnitGraph,
};
use events::{Event, EventBus, EventEnvelope};
use store::DurableStore;

use crate::capability::CapabilityRegistry;
use crate::config::OrchestratorConfig;
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, OrchestratorError, Result};
use crate::middleware::{
    ApprovalCoordinator, ApprovalDecision, CompactionMiddleware, DispatchLedger, GateMiddleware,
    LedgerMiddleware, MemoryMiddleware, Middleware,
};
use crate::request::{Budget, ExecutionRequest, ExecutionResult};
use crate::tutor::TutorService;

/// Why an `advance` round made no forward progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoProgressReason {
    SessionNotStarted,
    SessionPaused,
    SessionFailed,
    /// Every remaining ready unit has exhausted its dispatch rounds.
    RetriesExhausted,
    /// Remaining units are blocked behind unsettled prerequisites.
    Blocked,
}

/// Outcome of one scheduling round.
#[derive(Debug, Clone)]
pub enum AdvanceOutcome {
    /// At least one unit settled (completed or failed) this round.
    Progressed {
        completed: Vec<String>,
        failed: Vec<String>,
    },
    /// A dispatch parked on the approval gate; resolve it and advance again.
    AwaitingApproval { unit_id: String, request_id: Uuid },
    /// Only question units remain ready; they were presented and the
    /// session waits on answers through `submit_answer`.
    AwaitingAnswers { unit_ids: Vec<String> },
    /// Every unit is settled; the session transitioned to completed.
    Completed,
    NoProgress(NoProgressReason),
}

pub struct SessionService {
    config: OrchestratorConfig,
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<DispatchLedger>,
    coordinator: Arc<ApprovalCoordinator>,
    store: Arc<dyn DurableStore>,
    bus: EventBus,
    tutor: TutorService,
    sessions: Mutex<HashMap<Uuid, SessionState>>,
    /// Requests parked on approval, so re-dispatch reuses the request id.
    parked: Mutex<HashMap<Uuid, ExecutionRequest>>,
    /// Units whose approval was rejected; never dispatched again.
    rejected: Mutex<HashSet<(Uuid, String)>>,
}

impl SessionService {
    /// Wire the full pipeline: ledger, memory, compaction, gate, dispatcher.
    pub fn new(
        registry: CapabilityRegistry,
        store: Arc<dyn DurableStore>,
        bus: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        let ledger = Arc::new(DispatchLedger::new());
        let coordinator = Arc::new(ApprovalCoordinator::new());

        let stack: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(LedgerMiddleware::new(ledger.clone())),
            Arc::new(MemoryMiddleware::new(store.clone())),
            Arc::new(CompactionMiddleware::new(config.compaction_threshold_tokens)),
            Arc::new(GateMiddleware::new(coordinator.clone())),
        ];
        let dispatcher = Arc::new(Dispatcher::new(registry, stack, &config));
        let tutor = TutorService::new(
            dispatcher.clone(),
            store.clone(),
            bus.clone(),
            default_budget(&config),
        );

        Self {
            config,
            dispatcher,
            ledger,
            coordinator,
            store,
            bus,
            tutor,
            sessions: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn ledger(&self) -> &Arc<DispatchLedger> {
        &self.ledger
    }

    /// Create a session from planner output and start it.
    pub async fn start_session(
        &self,
        project: ProjectInfo,
        mode: LearningMode,
        selected_modules: Vec<String>,
        units: Vec<LearningUnit>,
        edges: Vec<PrerequisiteEdge>,
    ) -> Result<Uuid> {
        let graph = UnitGraph::build(units, edges)?;
        let mut session =
            SessionState::new(project, mode, graph).with_selected_modules(selected_modules);
        session.start()?;
        let session_id = session.id();
        let project_name = session.project().name.clone();

        self.store.save_progress(&session.snapshot()).await?;
        self.sessions.lock().unwrap().insert(session_id, session);

        info!(session_id = %session_id, project = %project_name, "Session started");
        self.emit(Event::SessionStarted {
            session_id,
            project: project_name,
        });
        Ok(session_id)
    }

    /// Rebuild a session from planner output plus its persisted snapshot.
    pub async fn restore_session(
        &self,
        session_id: Uuid,
        project: ProjectInfo,
        mode: LearningMode,
        selected_modules: Vec<String>,
        units: Vec<LearningUnit>,
        edges: Vec<PrerequisiteEdge>,
    ) -> Result<()> {
        let snapshot = self
            .store
            .load_progress(session_id)
            .await?
            .ok_or(OrchestratorError::SessionNotFound(session_id))?;

        let graph = UnitGraph::build(units, edges)?;
        let mut session = SessionState::new(project, mode, graph)
            .with_id(session_id)
            .with_selected_modules(selected_modules);
        session.restore(&snapshot);

        self.sessions.lock().unwrap().insert(session_id, session);
        info!(session_id = %session_id, "Session restored from snapshot");
        Ok(())
    }

    pub async fn pause(&self, session_id: Uuid) -> Result<()> {
        let snapshot = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            session.pause()?;
            session.snapshot()
        };
        self.store.save_progress(&snapshot).await?;
        self.emit(Event::SessionPaused { session_id });
        Ok(())
    }

    pub async fn resume(&self, session_id: Uuid) -> Result<()> {
        let snapshot = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            session.resume()?;
            session.snapshot()
        };
        self.store.save_progress(&snapshot).await?;
        self.emit(Event::SessionResumed { session_id });
        Ok(())
    }

    /// Skip a unit whose prerequisites are already satisfied.
    pub async fn skip(&self, session_id: Uuid, unit_id: &str) -> Result<()> {
        let snapshot = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            session.record_skipped(unit_id)?;
            session.snapshot()
        };
        self.store.save_progress(&snapshot).await?;
        self.emit(Event::UnitSkipped {
            session_id,
            unit_id: unit_id.to_string(),
        });
        Ok(())
    }

    /// Cancel the session: fire its cancellation token so every in-flight
    /// dispatch for it settles as cancelled, then fail the session. Other
    /// sessions on the same dispatcher keep running.
    pub async fn cancel(&self, session_id: Uuid) -> Result<()> {
        self.dispatcher.cancel_session(session_id);
        self.fail(session_id, "cancelled").await
    }

    /// Fail the session outright, for callers that hit an unrecoverable
    /// condition outside the dispatch path.
    pub async fn fail(&self, session_id: Uuid, reason: &str) -> Result<()> {
        let snapshot = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            session.fail(reason)?;
            session.snapshot()
        };
        self.store.save_progress(&snapshot).await?;
        self.emit(Event::SessionFailed {
            session_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Run one scheduling round.
    pub async fn advance(&self, session_id: Uuid) -> Result<AdvanceOutcome> {
        // Phase 1: decide what to dispatch while holding the lock.
        let requests = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;

            match session.status() {
                SessionStatus::Created => {
                    return Ok(AdvanceOutcome::NoProgress(NoProgressReason::SessionNotStarted))
                }
                SessionStatus::Paused => {
                    return Ok(AdvanceOutcome::NoProgress(NoProgressReason::SessionPaused))
                }
                SessionStatus::Failed => {
                    return Ok(AdvanceOutcome::NoProgress(NoProgressReason::SessionFailed))
                }
                SessionStatus::Completed => return Ok(AdvanceOutcome::Completed),
                SessionStatus::Active => {}
            }

            let ready = session.ready_units();
            // Question units are never dispatched to a capability; they are
            // presented and settle through `submit_answer`.
            let questions: Vec<String> = ready
                .iter()
                .filter(|id| {
                    session
                        .graph()
                        .get(id)
                        .map(LearningUnit::is_question)
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            let rejected = self.rejected.lock().unwrap();
            let dispatchable: Vec<&LearningUnit> = ready
                .iter()
                .filter(|id| !rejected.contains(&(session_id, (*id).clone())))
                .filter(|id| {
                    self.ledger.attempts(session_id, id) < self.config.max_unit_attempts
                })
                .filter_map(|id| session.graph().get(id))
                .filter(|unit| !unit.is_question())
                .collect();

            if dispatchable.is_empty() {
                drop(rejected);
                drop(sessions);
                if !questions.is_empty() {
                    return Ok(self.present_ready_questions(session_id, questions));
                }
                let (exhausted, blocked) = {
                    let sessions = self.sessions.lock().unwrap();
                    let session = sessions
                        .get(&session_id)
                        .ok_or(OrchestratorError::SessionNotFound(session_id))?;
                    (session.is_exhausted(), ready.is_empty())
                };
                if exhausted {
                    return self.finalize(session_id).await;
                }
                let reason = if blocked {
                    NoProgressReason::Blocked
                } else {
                    NoProgressReason::RetriesExhausted
                };
                return Ok(AdvanceOutcome::NoProgress(reason));
            }

            dispatchable
                .iter()
                .map(|unit| self.request_for(session_id, unit))
                .collect::<Vec<ExecutionRequest>>()
        };

        // Phase 2: dispatch without the lock.
        for request in &requests {
            self.emit(Event::UnitDispatched {
                session_id,
                unit_id: request.unit_id.clone(),
                capability: request.capability.clone(),
            });
        }
        let unit_ids: Vec<String> = requests.iter().map(|r| r.unit_id.clone()).collect();
        let results = self.dispatcher.dispatch_many(requests.clone()).await;

        // Phase 3: apply results.
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut pending: Option<(String, Uuid)> = None;

        {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;

            for ((unit_id, request), result) in
                unit_ids.iter().zip(requests.into_iter()).zip(results)
            {
                match result {
                    ExecutionResult::Success { .. } => {
                        session.record_completed(unit_id)?;
                        self.parked.lock().unwrap().remove(&request.request_id);
                        completed.push(unit_id.clone());
                    }
                    ExecutionResult::Failure(error) => {
                        session.record_failed(unit_id)?;
                        self.parked.lock().unwrap().remove(&request.request_id);
                        if let DispatchError::ApprovalRejected(_) = &error {
                            self.rejected
                                .lock()
                                .unwrap()
                                .insert((session_id, unit_id.clone()));
                        }
                        warn!(
                            session_id = %session_id,
                            unit_id = %unit_id,
                            error = %error,
                            "Unit dispatch failed"
                        );
                        failed.push((unit_id.clone(), error));
                    }
                    ExecutionResult::PendingApproval { request_id } => {
                        self.parked.lock().unwrap().insert(request_id, request);
                        if pending.is_none() {
                            pending = Some((unit_id.clone(), request_id));
                        }
                    }
                }
            }
        }

        for unit_id in &completed {
            self.emit(Event::UnitCompleted {
                session_id,
                unit_id: unit_id.clone(),
            });
        }
        for (unit_id, error) in &failed {
            self.emit(Event::UnitFailed {
                session_id,
                unit_id: unit_id.clone(),
                reason: error.to_string(),
            });
        }
        if let Some((unit_id, request_id)) = &pending {
            self.emit(Event::ApprovalRequested {
                session_id,
                unit_id: unit_id.clone(),
                request_id: *request_id,
            });
        }

        let snapshot = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?
                .snapshot()
        };
        self.store.save_progress(&snapshot).await?;

        let exhausted = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(&session_id)
                .map(|s| s.is_exhausted())
                .unwrap_or(false)
        };
        if exhausted {
            return self.finalize(session_id).await;
        }

        if let Some((unit_id, request_id)) = pending {
            return Ok(AdvanceOutcome::AwaitingApproval {
                unit_id,
                request_id,
            });
        }

        Ok(AdvanceOutcome::Progressed {
            completed,
            failed: failed.into_iter().map(|(unit_id, _)| unit_id).collect(),
        })
    }

    /// Drive `advance` until the session completes or stops progressing.
    pub async fn run_to_completion(&self, session_id: Uuid) -> Result<AdvanceOutcome> {
        loop {
            match self.advance(session_id).await? {
                AdvanceOutcome::Progressed { failed, .. } if failed.is_empty() => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Record a human decision and emit the resolution event. The caller
    /// advances the session again to act on it.
    pub fn approve(&self, session_id: Uuid, request_id: Uuid) -> Result<()> {
        self.coordinator
            .resolve(request_id, ApprovalDecision::Approved)?;
        self.emit(Event::ApprovalResolved {
            session_id,
            request_id,
            approved: true,
        });
        Ok(())
    }

    pub fn reject(&self, session_id: Uuid, request_id: Uuid) -> Result<()> {
        self.coordinator
            .resolve(request_id, ApprovalDecision::Rejected)?;
        self.emit(Event::ApprovalResolved {
            session_id,
            request_id,
            approved: false,
        });
        Ok(())
    }

    /// Submit an answer for a question unit and run the tutor loop. A
    /// passing evaluation settles the unit.
    pub async fn submit_answer(
        &self,
        session_id: Uuid,
        unit_id: &str,
        answer: &str,
        elapsed_secs: u64,
        hints_used: u32,
    ) -> Result<LearningRecord> {
        let unit = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            session
                .graph()
                .get(unit_id)
                .cloned()
                .ok_or_else(|| coach_core::StateError::UnitNotFound(unit_id.to_string()))?
        };
        if !unit.is_question() {
            return Err(OrchestratorError::NotAQuestion {
                unit_id: unit_id.to_string(),
            });
        }

        let record = self
            .tutor
            .submit_answer(session_id, &unit, answer, elapsed_secs, hints_used)
            .await?;

        if record.is_correct() {
            let snapshot = {
                let mut sessions = self.sessions.lock().unwrap();
                let session = sessions
                    .get_mut(&session_id)
                    .ok_or(OrchestratorError::SessionNotFound(session_id))?;
                session.record_completed(unit_id)?;
                session.snapshot()
            };
            self.store.save_progress(&snapshot).await?;
            self.emit(Event::UnitCompleted {
                session_id,
                unit_id: unit_id.to_string(),
            });
        }

        Ok(record)
    }

    /// Make a question unit available for answering.
    pub fn present_question(&self, session_id: Uuid, unit_id: &str) -> Result<()> {
        let is_question = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            session
                .graph()
                .get(unit_id)
                .map(|u| u.is_question())
                .ok_or_else(|| coach_core::StateError::UnitNotFound(unit_id.to_string()))?
        };
        if !is_question {
            return Err(OrchestratorError::NotAQuestion {
                unit_id: unit_id.to_string(),
            });
        }
        self.tutor.present(session_id, unit_id);
        self.emit(Event::QuestionPresented {
            session_id,
            unit_id: unit_id.to_string(),
        });
        Ok(())
    }

    /// Session progress enriched with tutor statistics from the store.
    pub async fn get_progress(&self, session_id: Uuid) -> Result<SessionProgress> {
        let mut progress = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?
                .progress()
        };

        let records = self.store.records_for_session(session_id).await?;
        let mut answered: Vec<String> = Vec::new();
        let mut correct: Vec<String> = Vec::new();
        let mut total_time = 0u64;
        let mut last_active = progress.last_active_at;
        for record in &records {
            if !answered.contains(&record.unit_id) {
                answered.push(record.unit_id.clone());
            }
            if record.is_correct() && !correct.contains(&record.unit_id) {
                correct.push(record.unit_id.clone());
            }
            total_time += record.elapsed_secs;
            if last_active.map(|t| record.created_at > t).unwrap_or(true) {
                last_active = Some(record.created_at);
            }
        }
        progress.answered_questions = answered;
        progress.correct_questions = correct;
        progress.total_time_spent_secs = total_time;
        progress.last_active_at = last_active;

        Ok(progress)
    }

    pub fn status(&self, session_id: Uuid) -> Result<SessionStatus> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions
            .get(&session_id)
            .ok_or(OrchestratorError::SessionNotFound(session_id))?
            .status())
    }

    pub fn summary(&self, session_id: Uuid) -> Result<Option<String>> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions
            .get(&session_id)
            .ok_or(OrchestratorError::SessionNotFound(session_id))?
            .summary()
            .map(str::to_string))
    }

    /// Fails when the planning ledger still shows in-flight dispatches,
    /// e.g. before tearing the service down or restoring over a session.
    pub fn ensure_quiescent(&self, session_id: Uuid) -> Result<()> {
        let in_flight = self.ledger.in_flight(session_id).len();
        if in_flight > 0 {
            return Err(OrchestratorError::IncompleteDispatch {
                session_id,
                in_flight,
            });
        }
        Ok(())
    }

    /// Present ready question units. Units already mid-attempt keep their
    /// phase; a recorded attempt re-arms on the next submission.
    fn present_ready_questions(&self, session_id: Uuid, unit_ids: Vec<String>) -> AdvanceOutcome {
        for unit_id in &unit_ids {
            if self.tutor.phase(session_id, unit_id).is_none() {
                self.tutor.present(session_id, unit_id);
                self.emit(Event::QuestionPresented {
                    session_id,
                    unit_id: unit_id.clone(),
                });
            }
        }
        AdvanceOutcome::AwaitingAnswers { unit_ids }
    }

    fn request_for(&self, session_id: Uuid, unit: &LearningUnit) -> ExecutionRequest {
        // A parked request keeps its id, so the gate can match the decision.
        {
            let parked = self.parked.lock().unwrap();
            if let Some(request) = parked
                .values()
                .find(|r| r.session_id == session_id && r.unit_id == unit.id)
            {
                return request.clone();
            }
        }

        let payload = json!({
            "unit_id": unit.id,
            "stage": unit.stage.as_str(),
            "title": unit.title,
            "description": unit.description,
            "difficulty": unit.difficulty.as_str(),
            "tags": unit.tags,
            "question": unit.question,
        });
        let mut request = ExecutionRequest::new(
            session_id,
            &unit.id,
            &unit.capability,
            payload,
            default_budget(&self.config),
        );
        if unit.requires_approval {
            request = request.with_approval_required();
        }
        request
    }

    /// All units settled: complete the session with a summary note.
    async fn finalize(&self, session_id: Uuid) -> Result<AdvanceOutcome> {
        let (snapshot, summary) = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get_mut(&session_id)
                .ok_or(OrchestratorError::SessionNotFound(session_id))?;
            if session.status() == SessionStatus::Completed {
                return Ok(AdvanceOutcome::Completed);
            }
            let progress = session.progress();
            let summary = format!(
                "{} of {} units completed, {} skipped",
                progress.completed, progress.total_units, progress.skipped
            );
            session.complete(Some(summary.clone()))?;
            (session.snapshot(), summary)
        };
        self.store.save_progress(&snapshot).await?;
        info!(session_id = %session_id, summary = %summary, "Session completed");
        self.emit(Event::SessionCompleted {
            session_id,
            summary: Some(summary),
        });
        Ok(AdvanceOutcome::Completed)
    }

    fn emit(&self, event: Event) {
        self.bus.publish(EventEnvelope::new(event));
    }
}

fn default_budget(config: &OrchestratorConfig) -> Budget {
    Budget::new(config.default_max_duration, config.default_max_context_tokens)
}
