//! Domain model for the learning-session orchestration core.
//!
//! This crate defines the data that every other crate operates on: learning
//! units and their dependency graph, session state and progress, and the
//! records produced by the tutor evaluation loop. It contains no IO; the
//! store and orchestrator crates build on top of these types.

pub mod domain;
pub mod error;

pub use domain::graph::{PrerequisiteEdge, ProgressDelta, UnitGraph};
pub use domain::record::{
    Citation, Evaluation, Explanation, LearningRecord, QuestionPhase, PASSING_SCORE,
};
pub use domain::session::{
    LearningMode, ProgressSnapshot, ProjectInfo, SessionProgress, SessionState, SessionStatus,
    StageProgress,
};
pub use domain::unit::{Difficulty, LearningUnit, QuestionSpec, UnitStage};
pub use error::{GraphError, StateError};
