//! Tutor evaluation loop.
//!
//! A question unit moves through presented, answer submitted, evaluated,
//! explained, recorded. Evaluation goes to the "tutor" capability;
//! explanations for surfaced gaps go to the "explainer" capability and must
//! cite at least one source location. Every attempt ends in an immutable
//! learning record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use coach_core::{
    Evaluation, Explanation, LearningRecord, LearningUnit, QuestionPhase, StateError,
};
use events::{Event, EventBus, EventEnvelope};
use store::DurableStore;

use crate::capability::names;
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, OrchestratorError, Result};
use crate::request::{Budget, ExecutionRequest, ExecutionResult};

pub struct TutorService {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn DurableStore>,
    bus: EventBus,
    budget: Budget,
    phases: Mutex<HashMap<(Uuid, String), QuestionPhase>>,
}

impl TutorService {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn DurableStore>,
        bus: EventBus,
        budget: Budget,
    ) -> Self {
        Self {
            dispatcher,
            store,
            bus,
            budget,
            phases: Mutex::new(HashMap::new()),
        }
    }

    /// Mark a question as presented to the learner. Re-presenting after a
    /// recorded attempt starts the next attempt.
    pub fn present(&self, session_id: Uuid, unit_id: &str) {
        self.phases
            .lock()
            .unwrap()
            .insert((session_id, unit_id.to_string()), QuestionPhase::Presented);
    }

    pub fn phase(&self, session_id: Uuid, unit_id: &str) -> Option<QuestionPhase> {
        self.phases
            .lock()
            .unwrap()
            .get(&(session_id, unit_id.to_string()))
            .copied()
    }

    fn set_phase(&self, session_id: Uuid, unit_id: &str, phase: QuestionPhase) {
        self.phases
            .lock()
            .unwrap()
            .insert((session_id, unit_id.to_string()), phase);
    }

    fn require_phase(
        &self,
        session_id: Uuid,
        unit_id: &str,
        expected: QuestionPhase,
    ) -> Result<()> {
        let phase = self
            .phase(session_id, unit_id)
            .unwrap_or(QuestionPhase::Presented);
        if phase != expected {
            return Err(StateError::QuestionPhaseMismatch {
                unit_id: unit_id.to_string(),
                phase: phase.as_str().to_string(),
                expected: expected.as_str().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Run one full attempt: evaluate the answer, explain the gaps, write
    /// the record. Returns the stored record.
    pub async fn submit_answer(
        &self,
        session_id: Uuid,
        unit: &LearningUnit,
        answer: &str,
        elapsed_secs: u64,
        hints_used: u32,
    ) -> Result<LearningRecord> {
        let unit_id = unit.id.as_str();

        // A question never presented is treated as presented on first
        // submission; a recorded question starts a fresh attempt.
        match self.phase(session_id, unit_id) {
            None | Some(QuestionPhase::Presented) | Some(QuestionPhase::Recorded) => {}
            Some(_) => {
                self.require_phase(session_id, unit_id, QuestionPhase::Presented)?;
            }
        }
        self.set_phase(session_id, unit_id, QuestionPhase::AnswerSubmitted);

        let evaluation = self.evaluate(session_id, unit, answer).await?;
        self.set_phase(session_id, unit_id, QuestionPhase::Evaluated);
        self.bus.publish(EventEnvelope::new(Event::AnswerEvaluated {
            session_id,
            unit_id: unit_id.to_string(),
            score: evaluation.score,
            passed: evaluation.is_passing(),
        }));

        let gaps: Vec<String> = evaluation
            .incomplete_points
            .iter()
            .chain(evaluation.incorrect_points.iter())
            .cloned()
            .collect();
        let explanation = if gaps.is_empty() && evaluation.is_passing() {
            None
        } else {
            let explanation = self.explain(session_id, unit, &gaps).await?;
            self.set_phase(session_id, unit_id, QuestionPhase::Explained);
            Some(explanation)
        };

        let attempt_number = self
            .store
            .records_for_unit(session_id, unit_id)
            .await?
            .len() as u32
            + 1;

        let mut record = LearningRecord::new(session_id, unit_id, answer, evaluation)
            .with_elapsed_secs(elapsed_secs)
            .with_attempt_number(attempt_number)
            .with_hints_used(hints_used);
        if let Some(explanation) = explanation {
            record = record.with_explanation(explanation);
        }

        self.store.append_record(&record).await?;
        self.set_phase(session_id, unit_id, QuestionPhase::Recorded);
        info!(
            session_id = %session_id,
            unit_id = %unit_id,
            score = record.evaluation.score,
            attempt = attempt_number,
            "Learning record written"
        );

        Ok(record)
    }

    async fn evaluate(
        &self,
        session_id: Uuid,
        unit: &LearningUnit,
        answer: &str,
    ) -> Result<Evaluation> {
        let expected_points = unit
            .question
            .as_ref()
            .map(|q| q.expected_points.clone())
            .unwrap_or_default();
        let request = ExecutionRequest::new(
            session_id,
            &unit.id,
            names::TUTOR,
            json!({
                "question": unit.title,
                "description": unit.description,
                "expected_points": expected_points,
                "answer": answer,
            }),
            self.budget,
        );

        let payload = match self.dispatcher.dispatch(request).await {
            ExecutionResult::Success { payload, .. } => payload,
            ExecutionResult::Failure(error) => return Err(error.into()),
            ExecutionResult::PendingApproval { request_id } => {
                // Tutor requests are never approval-guarded.
                return Err(DispatchError::InvalidOutput(format!(
                    "tutor dispatch unexpectedly parked on approval ({request_id})"
                ))
                .into());
            }
        };

        let evaluation: Evaluation = serde_json::from_value(payload).map_err(|e| {
            OrchestratorError::Dispatch(DispatchError::InvalidOutput(format!(
                "tutor returned malformed evaluation: {e}"
            )))
        })?;
        if !(0.0..=100.0).contains(&evaluation.score) {
            return Err(DispatchError::InvalidOutput(format!(
                "evaluation score {} outside 0..=100",
                evaluation.score
            ))
            .into());
        }
        debug!(
            session_id = %session_id,
            unit_id = %unit.id,
            score = evaluation.score,
            "Answer evaluated"
        );
        Ok(evaluation)
    }

    async fn explain(
        &self,
        session_id: Uuid,
        unit: &LearningUnit,
        gaps: &[String],
    ) -> Result<Explanation> {
        let request = ExecutionRequest::new(
            session_id,
            &unit.id,
            names::EXPLAINER,
            json!({
                "question": unit.title,
                "description": unit.description,
                "gaps": gaps,
                "recommended_files": unit
                    .question
                    .as_ref()
                    .map(|q| q.recommended_files.clone())
                    .unwrap_or_default(),
            }),
            self.budget,
        );

        let payload = match self.dispatcher.dispatch(request).await {
            ExecutionResult::Success { payload, .. } => payload,
            ExecutionResult::Failure(error) => return Err(error.into()),
            ExecutionResult::PendingApproval { request_id } => {
                return Err(DispatchError::InvalidOutput(format!(
                    "explainer dispatch unexpectedly parked on approval ({request_id})"
                ))
                .into());
            }
        };

        let explanation: Explanation = serde_json::from_value(payload).map_err(|e| {
            OrchestratorError::Dispatch(DispatchError::InvalidOutput(format!(
                "explainer returned malformed explanation: {e}"
            )))
        })?;
        // An explanation without a source reference teaches nothing
        // verifiable; reject it.
        if explanation.citations.is_empty() {
            return Err(DispatchError::InvalidOutput(
                "explanation carries no citations".to_string(),
            )
            .into());
        }
        Ok(explanation)
    }
}
