use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::graph::{ProgressDelta, UnitGraph};
use crate::domain::unit::UnitStage;
use crate::error::StateError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Created,
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Statuses reachable from `self`. `Failed` is reachable from any
    /// non-terminal status and is handled separately in `can_transition`.
    fn allowed_transitions(&self) -> &'static [SessionStatus] {
        match self {
            Self::Created => &[Self::Active],
            Self::Active => &[Self::Paused, Self::Completed],
            Self::Paused => &[Self::Active],
            Self::Completed => &[],
            Self::Failed => &[],
        }
    }

    pub fn can_transition(&self, to: SessionStatus) -> bool {
        if to == Self::Failed {
            return !self.is_terminal();
        }
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LearningMode {
    /// Whole-project pass through every stage.
    #[default]
    Macro,
    /// Deep dive into selected capability modules.
    Capability,
}

impl LearningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Macro => "macro",
            Self::Capability => "capability",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "macro" => Some(Self::Macro),
            "capability" => Some(Self::Capability),
            _ => None,
        }
    }
}

/// Read-only project metadata produced by upstream repository analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: Uuid,
    pub name: String,
    pub language: String,
    pub archetype: String,
    pub modules: Vec<String>,
}

impl ProjectInfo {
    pub fn new(name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            language: language.into(),
            archetype: "library".to_string(),
            modules: Vec::new(),
        }
    }

    pub fn with_archetype(mut self, archetype: impl Into<String>) -> Self {
        self.archetype = archetype.into();
        self
    }

    pub fn with_modules(mut self, modules: Vec<String>) -> Self {
        self.modules = modules;
        self
    }
}

/// Per-stage completion counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageProgress {
    pub stage: UnitStage,
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
}

impl StageProgress {
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed + self.skipped) as f32 / self.total as f32 * 100.0
    }
}

/// Aggregated session progress, safe to hand to a presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionProgress {
    pub total_units: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stages: Vec<StageProgress>,
    pub answered_questions: Vec<String>,
    pub correct_questions: Vec<String>,
    pub total_time_spent_secs: u64,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl SessionProgress {
    pub fn overall_percent(&self) -> f32 {
        if self.total_units == 0 {
            return 0.0;
        }
        (self.completed + self.skipped) as f32 / self.total_units as f32 * 100.0
    }
}

/// One learning session: owns the unit graph and the authoritative
/// completion state. All mutation goes through the transition methods,
/// which enforce the status machine; callers never poke fields directly.
#[derive(Debug, Clone)]
pub struct SessionState {
    id: Uuid,
    project: ProjectInfo,
    mode: LearningMode,
    selected_modules: Vec<String>,
    status: SessionStatus,
    current_stage: UnitStage,
    graph: UnitGraph,
    delta: ProgressDelta,
    failed_units: BTreeSet<String>,
    summary: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(project: ProjectInfo, mode: LearningMode, graph: UnitGraph) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project,
            mode,
            selected_modules: Vec::new(),
            status: SessionStatus::Created,
            current_stage: UnitStage::default(),
            graph,
            delta: ProgressDelta::new(),
            failed_units: BTreeSet::new(),
            summary: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_selected_modules(mut self, modules: Vec<String>) -> Self {
        self.selected_modules = modules;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn project(&self) -> &ProjectInfo {
        &self.project
    }

    pub fn mode(&self) -> LearningMode {
        self.mode
    }

    pub fn selected_modules(&self) -> &[String] {
        &self.selected_modules
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn current_stage(&self) -> UnitStage {
        self.current_stage
    }

    pub fn graph(&self) -> &UnitGraph {
        &self.graph
    }

    pub fn delta(&self) -> &ProgressDelta {
        &self.delta
    }

    pub fn failed_units(&self) -> &BTreeSet<String> {
        &self.failed_units
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn transition(&mut self, to: SessionStatus) -> Result<(), StateError> {
        if !self.status.can_transition(to) {
            return Err(StateError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), StateError> {
        self.transition(SessionStatus::Active)
    }

    pub fn pause(&mut self) -> Result<(), StateError> {
        self.transition(SessionStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<(), StateError> {
        self.transition(SessionStatus::Active)
    }

    pub fn complete(&mut self, summary: Option<String>) -> Result<(), StateError> {
        self.transition(SessionStatus::Completed)?;
        self.summary = summary;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        self.transition(SessionStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Ready units for this session, honoring capability-mode filtering.
    pub fn ready_units(&self) -> Vec<String> {
        let ready = self.graph.ready_set(&self.delta);
        match self.mode {
            LearningMode::Macro => ready,
            LearningMode::Capability => ready
                .into_iter()
                .filter(|id| {
                    self.graph
                        .get(id)
                        .and_then(|u| u.capability_module.as_ref())
                        .map(|m| self.selected_modules.contains(m))
                        // Untagged units stay schedulable in capability mode.
                        .unwrap_or(true)
                })
                .collect(),
        }
    }

    pub fn record_completed(&mut self, unit_id: &str) -> Result<(), StateError> {
        let delta = self
            .graph
            .mark_complete(&self.delta, unit_id)
            .map_err(|_| StateError::UnitNotFound(unit_id.to_string()))?;
        self.delta = delta;
        self.failed_units.remove(unit_id);
        self.advance_stage_pointer(unit_id);
        self.touch();
        Ok(())
    }

    /// Skipping is only legal once the unit's prerequisites are satisfied.
    pub fn record_skipped(&mut self, unit_id: &str) -> Result<(), StateError> {
        if !self.graph.contains(unit_id) {
            return Err(StateError::UnitNotFound(unit_id.to_string()));
        }
        if !self.graph.prerequisites_satisfied(&self.delta, unit_id) {
            return Err(StateError::PrerequisiteUnmet(unit_id.to_string()));
        }
        let delta = self
            .graph
            .mark_skipped(&self.delta, unit_id)
            .map_err(|_| StateError::UnitNotFound(unit_id.to_string()))?;
        self.delta = delta;
        self.failed_units.remove(unit_id);
        self.advance_stage_pointer(unit_id);
        self.touch();
        Ok(())
    }

    /// A failed unit stays neither completed nor skipped; the caller can
    /// retry, skip, or end the session.
    pub fn record_failed(&mut self, unit_id: &str) -> Result<(), StateError> {
        if !self.graph.contains(unit_id) {
            return Err(StateError::UnitNotFound(unit_id.to_string()));
        }
        self.failed_units.insert(unit_id.to_string());
        self.touch();
        Ok(())
    }

    pub fn is_exhausted(&self) -> bool {
        self.graph.is_exhausted(&self.delta)
    }

    pub fn progress(&self) -> SessionProgress {
        let mut stages: Vec<StageProgress> = UnitStage::ALL
            .iter()
            .map(|stage| StageProgress {
                stage: *stage,
                total: 0,
                completed: 0,
                skipped: 0,
            })
            .collect();

        for unit in self.graph.units() {
            let entry = &mut stages[unit.stage.order()];
            entry.total += 1;
            if self.delta.completed.contains(&unit.id) {
                entry.completed += 1;
            } else if self.delta.skipped.contains(&unit.id) {
                entry.skipped += 1;
            }
        }
        stages.retain(|s| s.total > 0);

        SessionProgress {
            total_units: self.graph.len(),
            completed: self.delta.completed.len(),
            skipped: self.delta.skipped.len(),
            failed: self.failed_units.len(),
            stages,
            answered_questions: Vec::new(),
            correct_questions: Vec::new(),
            total_time_spent_secs: 0,
            last_active_at: Some(self.updated_at),
        }
    }

    /// Serializable snapshot for the durable store.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            session_id: self.id,
            project_id: self.project.id,
            status: self.status,
            mode: self.mode,
            current_stage: self.current_stage,
            completed: self.delta.completed.clone(),
            skipped: self.delta.skipped.clone(),
            failed: self.failed_units.clone(),
            summary: self.summary.clone(),
            captured_at: Utc::now(),
        }
    }

    /// Restore completion state from a persisted snapshot. The graph itself
    /// is rebuilt from planner output and is not part of the snapshot.
    pub fn restore(&mut self, snapshot: &ProgressSnapshot) {
        self.status = snapshot.status;
        self.current_stage = snapshot.current_stage;
        self.delta = ProgressDelta {
            completed: snapshot.completed.clone(),
            skipped: snapshot.skipped.clone(),
        };
        self.failed_units = snapshot.failed.clone();
        self.summary = snapshot.summary.clone();
        self.touch();
    }

    fn advance_stage_pointer(&mut self, unit_id: &str) {
        if let Some(unit) = self.graph.get(unit_id) {
            if unit.stage.order() > self.current_stage.order() {
                self.current_stage = unit.stage;
            }
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Point-in-time progress snapshot persisted through the durable store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    pub project_id: Uuid,
    pub status: SessionStatus,
    pub mode: LearningMode,
    pub current_stage: UnitStage,
    pub completed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub summary: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::unit::LearningUnit;

    fn graph() -> UnitGraph {
        UnitGraph::build(
            vec![
                LearningUnit::new("a", UnitStage::Architecture, "A", ""),
                LearningUnit::new("b", UnitStage::Module, "B", "")
                    .with_prerequisites(vec!["a".to_string()]),
            ],
            vec![],
        )
        .unwrap()
    }

    fn session() -> SessionState {
        SessionState::new(
            ProjectInfo::new("demo", "rust"),
            LearningMode::Macro,
            graph(),
        )
    }

    #[test]
    fn test_status_transitions() {
        assert!(SessionStatus::Created.can_transition(SessionStatus::Active));
        assert!(SessionStatus::Active.can_transition(SessionStatus::Paused));
        assert!(SessionStatus::Paused.can_transition(SessionStatus::Active));
        assert!(SessionStatus::Active.can_transition(SessionStatus::Completed));
        assert!(!SessionStatus::Created.can_transition(SessionStatus::Completed));
        assert!(!SessionStatus::Completed.can_transition(SessionStatus::Active));
        assert!(!SessionStatus::Completed.can_transition(SessionStatus::Failed));
        assert!(SessionStatus::Paused.can_transition(SessionStatus::Failed));
    }

    #[test]
    fn test_lifecycle() {
        let mut s = session();
        assert_eq!(s.status(), SessionStatus::Created);

        s.start().unwrap();
        assert_eq!(s.status(), SessionStatus::Active);

        // Double start is rejected.
        assert!(matches!(
            s.start(),
            Err(StateError::InvalidTransition { .. })
        ));

        s.pause().unwrap();
        s.resume().unwrap();
        s.complete(Some("done".to_string())).unwrap();
        assert_eq!(s.status(), SessionStatus::Completed);
        assert_eq!(s.summary(), Some("done"));
    }

    #[test]
    fn test_record_completed_updates_ready_units() {
        let mut s = session();
        s.start().unwrap();

        assert_eq!(s.ready_units(), vec!["a"]);
        s.record_completed("a").unwrap();
        assert_eq!(s.ready_units(), vec!["b"]);
        assert_eq!(s.current_stage(), UnitStage::Architecture);

        s.record_completed("b").unwrap();
        assert!(s.is_exhausted());
        assert_eq!(s.current_stage(), UnitStage::Module);
    }

    #[test]
    fn test_skip_requires_prerequisites() {
        let mut s = session();
        s.start().unwrap();

        assert_eq!(
            s.record_skipped("b"),
            Err(StateError::PrerequisiteUnmet("b".to_string()))
        );

        s.record_completed("a").unwrap();
        s.record_skipped("b").unwrap();
        assert!(s.is_exhausted());
    }

    #[test]
    fn test_failed_unit_is_neither_completed_nor_skipped() {
        let mut s = session();
        s.start().unwrap();

        s.record_failed("a").unwrap();
        assert!(s.failed_units().contains("a"));
        assert!(!s.is_exhausted());
        // Still ready: the caller may retry.
        assert_eq!(s.ready_units(), vec!["a"]);

        s.record_completed("a").unwrap();
        assert!(!s.failed_units().contains("a"));
    }

    #[test]
    fn test_capability_mode_filters_ready_units() {
        let graph = UnitGraph::build(
            vec![
                LearningUnit::new("a", UnitStage::Architecture, "A", "")
                    .with_capability_module("cache_layer"),
                LearningUnit::new("b", UnitStage::Architecture, "B", "")
                    .with_capability_module("event_system"),
                LearningUnit::new("c", UnitStage::Architecture, "C", ""),
            ],
            vec![],
        )
        .unwrap();
        let mut s = SessionState::new(
            ProjectInfo::new("demo", "rust"),
            LearningMode::Capability,
            graph,
        )
        .with_selected_modules(vec!["cache_layer".to_string()]);
        s.start().unwrap();

        assert_eq!(s.ready_units(), vec!["a", "c"]);
    }

    #[test]
    fn test_progress_counts() {
        let mut s = session();
        s.start().unwrap();
        s.record_completed("a").unwrap();

        let progress = s.progress();
        assert_eq!(progress.total_units, 2);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.stages.len(), 2);
        assert_eq!(progress.stages[0].completed, 1);
        assert!((progress.overall_percent() - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut s = session();
        s.start().unwrap();
        s.record_completed("a").unwrap();
        let snapshot = s.snapshot();

        let mut restored = session().with_id(s.id());
        restored.restore(&snapshot);
        assert_eq!(restored.status(), SessionStatus::Active);
        assert!(restored.delta().completed.contains("a"));
        assert_eq!(restored.ready_units(), vec!["b"]);
    }

    #[test]
    fn test_terminal_state_rejects_transitions() {
        let mut s = session();
        s.start().unwrap();
        s.fail("capability outage").unwrap();

        assert!(s.resume().is_err());
        assert!(s.pause().is_err());
        assert_eq!(s.failure_reason(), Some("capability outage"));
        let _ = s.progress();
    }
}
