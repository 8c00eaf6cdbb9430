use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimum evaluation score counted as a correct answer.
pub const PASSING_SCORE: f32 = 60.0;

/// Lifecycle of a question unit inside the tutor loop. Phases advance
/// strictly forward; `next` returns `None` once the record is written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionPhase {
    Presented,
    AnswerSubmitted,
    Evaluated,
    Explained,
    Recorded,
}

impl QuestionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presented => "presented",
            Self::AnswerSubmitted => "answer_submitted",
            Self::Evaluated => "evaluated",
            Self::Explained => "explained",
            Self::Recorded => "recorded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "presented" => Some(Self::Presented),
            "answer_submitted" => Some(Self::AnswerSubmitted),
            "evaluated" => Some(Self::Evaluated),
            "explained" => Some(Self::Explained),
            "recorded" => Some(Self::Recorded),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Presented => Some(Self::AnswerSubmitted),
            Self::AnswerSubmitted => Some(Self::Evaluated),
            Self::Evaluated => Some(Self::Explained),
            Self::Explained => Some(Self::Recorded),
            Self::Recorded => None,
        }
    }
}

/// Tutor verdict for one submitted answer. The three point lists partition
/// the question's expected answer points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Evaluation {
    /// Score in the range 0..=100.
    pub score: f32,
    pub correct_points: Vec<String>,
    pub incomplete_points: Vec<String>,
    pub incorrect_points: Vec<String>,
    pub feedback: Option<String>,
}

impl Evaluation {
    pub fn is_passing(&self) -> bool {
        self.score >= PASSING_SCORE
    }
}

/// Reference into the repository under study.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
}

impl Citation {
    pub fn new(file_path: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        Self {
            file_path: file_path.into(),
            start_line,
            end_line,
        }
    }
}

/// Explainer output for the gaps an evaluation surfaced. Explanations must
/// cite at least one source location; that rule is enforced at the
/// capability boundary, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Explanation {
    pub summary: String,
    pub citations: Vec<Citation>,
    /// Which incomplete or incorrect points the explanation covers.
    pub addressed_points: Vec<String>,
}

/// Immutable account of one question attempt. Records are append-only;
/// a retry produces a new record with a bumped attempt number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub unit_id: String,
    pub answer: String,
    pub evaluation: Evaluation,
    pub explanation: Option<Explanation>,
    pub elapsed_secs: u64,
    pub attempt_number: u32,
    pub hints_used: u32,
    pub created_at: DateTime<Utc>,
}

impl LearningRecord {
    pub fn new(
        session_id: Uuid,
        unit_id: impl Into<String>,
        answer: impl Into<String>,
        evaluation: Evaluation,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            unit_id: unit_id.into(),
            answer: answer.into(),
            evaluation,
            explanation: None,
            elapsed_secs: 0,
            attempt_number: 1,
            hints_used: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_explanation(mut self, explanation: Explanation) -> Self {
        self.explanation = Some(explanation);
        self
    }

    pub fn with_elapsed_secs(mut self, secs: u64) -> Self {
        self.elapsed_secs = secs;
        self
    }

    pub fn with_attempt_number(mut self, attempt: u32) -> Self {
        self.attempt_number = attempt;
        self
    }

    pub fn with_hints_used(mut self, hints: u32) -> Self {
        self.hints_used = hints;
        self
    }

    pub fn is_correct(&self) -> bool {
        self.evaluation.is_passing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_advances_strictly_forward() {
        let mut phase = QuestionPhase::Presented;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            phase = next;
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                QuestionPhase::Presented,
                QuestionPhase::AnswerSubmitted,
                QuestionPhase::Evaluated,
                QuestionPhase::Explained,
                QuestionPhase::Recorded,
            ]
        );
        assert_eq!(QuestionPhase::Recorded.next(), None);
    }

    #[test]
    fn test_phase_string_roundtrip() {
        for phase in [
            QuestionPhase::Presented,
            QuestionPhase::AnswerSubmitted,
            QuestionPhase::Evaluated,
            QuestionPhase::Explained,
            QuestionPhase::Recorded,
        ] {
            assert_eq!(QuestionPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(QuestionPhase::parse("unknown"), None);
    }

    #[test]
    fn test_passing_threshold() {
        let evaluation = Evaluation {
            score: PASSING_SCORE,
            ..Default::default()
        };
        assert!(evaluation.is_passing());

        let evaluation = Evaluation {
            score: PASSING_SCORE - 0.1,
            ..Default::default()
        };
        assert!(!evaluation.is_passing());
    }

    #[test]
    fn test_record_builder() {
        let session_id = Uuid::new_v4();
        let record = LearningRecord::new(
            session_id,
            "q1",
            "the event bus decouples producers from consumers",
            Evaluation {
                score: 85.0,
                correct_points: vec!["decoupling".to_string()],
                ..Default::default()
            },
        )
        .with_explanation(Explanation {
            summary: "See how subscribers attach.".to_string(),
            citations: vec![Citation::new("src/bus.rs", 10, 42)],
            addressed_points: vec![],
        })
        .with_elapsed_secs(95)
        .with_attempt_number(2)
        .with_hints_used(1);

        assert_eq!(record.session_id, session_id);
        assert!(record.is_correct());
        assert_eq!(record.attempt_number, 2);
        assert_eq!(record.explanation.as_ref().unwrap().citations.len(), 1);
    }
}
