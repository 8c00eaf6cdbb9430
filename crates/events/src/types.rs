//! Event types emitted by the learning orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Session lifecycle
    #[serde(rename = "session.started")]
    SessionStarted { session_id: Uuid, project: String },

    #[serde(rename = "session.paused")]
    SessionPaused { session_id: Uuid },

    #[serde(rename = "session.resumed")]
    SessionResumed { session_id: Uuid },

    #[serde(rename = "session.completed")]
    SessionCompleted {
        session_id: Uuid,
        summary: Option<String>,
    },

    #[serde(rename = "session.failed")]
    SessionFailed { session_id: Uuid, reason: String },

    // Unit dispatch
    #[serde(rename = "unit.dispatched")]
    UnitDispatched {
        session_id: Uuid,
        unit_id: String,
        capability: String,
    },

    #[serde(rename = "unit.completed")]
    UnitCompleted { session_id: Uuid, unit_id: String },

    #[serde(rename = "unit.failed")]
    UnitFailed {
        session_id: Uuid,
        unit_id: String,
        reason: String,
    },

    #[serde(rename = "unit.skipped")]
    UnitSkipped { session_id: Uuid, unit_id: String },

    // Approval gate
    #[serde(rename = "approval.requested")]
    ApprovalRequested {
        session_id: Uuid,
        unit_id: String,
        request_id: Uuid,
    },

    #[serde(rename = "approval.resolved")]
    ApprovalResolved {
        session_id: Uuid,
        request_id: Uuid,
        approved: bool,
    },

    // Tutor loop
    #[serde(rename = "question.presented")]
    QuestionPresented { session_id: Uuid, unit_id: String },

    #[serde(rename = "answer.evaluated")]
    AnswerEvaluated {
        session_id: Uuid,
        unit_id: String,
        score: f32,
        passed: bool,
    },

    // System events
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the session ID associated with this event, if any
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Event::SessionStarted { session_id, .. } => Some(*session_id),
            Event::SessionPaused { session_id } => Some(*session_id),
            Event::SessionResumed { session_id } => Some(*session_id),
            Event::SessionCompleted { session_id, .. } => Some(*session_id),
            Event::SessionFailed { session_id, .. } => Some(*session_id),
            Event::UnitDispatched { session_id, .. } => Some(*session_id),
            Event::UnitCompleted { session_id, .. } => Some(*session_id),
            Event::UnitFailed { session_id, .. } => Some(*session_id),
            Event::UnitSkipped { session_id, .. } => Some(*session_id),
            Event::ApprovalRequested { session_id, .. } => Some(*session_id),
            Event::ApprovalResolved { session_id, .. } => Some(*session_id),
            Event::QuestionPresented { session_id, .. } => Some(*session_id),
            Event::AnswerEvaluated { session_id, .. } => Some(*session_id),
            Event::Error { .. } => None,
        }
    }

    /// Get the unit ID associated with this event, if any
    pub fn unit_id(&self) -> Option<&str> {
        match self {
            Event::UnitDispatched { unit_id, .. }
            | Event::UnitCompleted { unit_id, .. }
            | Event::UnitFailed { unit_id, .. }
            | Event::UnitSkipped { unit_id, .. }
            | Event::ApprovalRequested { unit_id, .. }
            | Event::AnswerEvaluated { unit_id, .. } => Some(unit_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let event = Event::SessionStarted {
            session_id: Uuid::new_v4(),
            project: "demo".to_string(),
        };
        let envelope = EventEnvelope::new(event);

        assert!(!envelope.id.is_nil());
        assert!(envelope.timestamp <= Utc::now());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::UnitFailed {
            session_id: Uuid::new_v4(),
            unit_id: "arch-overview".to_string(),
            reason: "timeout".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("unit.failed"));
        assert!(json.contains("arch-overview"));
        assert!(json.contains("timeout"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"session.started","session_id":"550e8400-e29b-41d4-a716-446655440000","project":"demo"}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::SessionStarted {
                session_id,
                project,
            } => {
                assert_eq!(project, "demo");
                assert!(!session_id.is_nil());
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_accessors() {
        let session_id = Uuid::new_v4();

        let event = Event::UnitCompleted {
            session_id,
            unit_id: "u1".to_string(),
        };
        assert_eq!(event.session_id(), Some(session_id));
        assert_eq!(event.unit_id(), Some("u1"));

        let error_event = Event::Error {
            message: "test".to_string(),
            context: None,
        };
        assert_eq!(error_event.session_id(), None);
        assert_eq!(error_event.unit_id(), None);
    }

    #[test]
    fn test_approval_events() {
        let request_id = Uuid::new_v4();
        let event = Event::ApprovalResolved {
            session_id: Uuid::new_v4(),
            request_id,
            approved: true,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("approval.resolved"));
        assert!(json.contains("\"approved\":true"));
    }
}
