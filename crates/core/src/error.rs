use thiserror::Error;
use uuid::Uuid;

/// Structural graph errors. These are fatal: a graph that fails validation
/// is never constructed, so execution cannot start against a bad graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cyclic dependency among units: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("unit {unit} references missing prerequisite: {prerequisite}")]
    DanglingPrerequisite { unit: String, prerequisite: String },

    #[error("duplicate unit id: {0}")]
    DuplicateUnit(String),

    #[error("unknown unit: {0}")]
    UnknownUnit(String),
}

/// Illegal state-machine transition attempts. Always returned synchronously
/// to the caller, never swallowed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("prerequisites not satisfied for unit: {0}")]
    PrerequisiteUnmet(String),

    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("question {unit_id} is in phase {phase}, expected {expected}")]
    QuestionPhaseMismatch {
        unit_id: String,
        phase: String,
        expected: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_members() {
        let error = GraphError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert!(error.to_string().contains("a -> b -> a"));
    }

    #[test]
    fn test_state_error_display() {
        let error = StateError::InvalidTransition {
            from: "completed".into(),
            to: "active".into(),
        };
        assert!(error.to_string().contains("completed"));
        assert!(error.to_string().contains("active"));
    }
}
