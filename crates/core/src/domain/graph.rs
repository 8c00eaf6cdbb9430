//! Unit dependency graph.
//!
//! Built once per session from planner output and structurally immutable
//! afterwards. Completion and skip status live in a [`ProgressDelta`] owned
//! by the session state machine; the graph itself only answers questions
//! about structure and readiness.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::unit::LearningUnit;
use crate::error::GraphError;

/// An explicit prerequisite edge: `prerequisite` must be completed or
/// skipped before `unit` becomes ready.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrerequisiteEdge {
    pub unit: String,
    pub prerequisite: String,
}

impl PrerequisiteEdge {
    pub fn new(unit: impl Into<String>, prerequisite: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            prerequisite: prerequisite.into(),
        }
    }
}

/// Immutable snapshot of which units are completed or skipped.
///
/// Deltas are values: `with_completed`/`with_skipped` return a new snapshot
/// and leave the original untouched, so the state machine can keep the
/// authoritative copy while handing read-only views to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub completed: BTreeSet<String>,
    pub skipped: BTreeSet<String>,
}

impl ProgressDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completed(&self, unit_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.completed.insert(unit_id.into());
        next
    }

    pub fn with_skipped(&self, unit_id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.skipped.insert(unit_id.into());
        next
    }

    pub fn is_settled(&self, unit_id: &str) -> bool {
        self.completed.contains(unit_id) || self.skipped.contains(unit_id)
    }

    pub fn settled_count(&self) -> usize {
        self.completed.len() + self.skipped.len()
    }
}

/// The full set of learning units for one session plus the prerequisite
/// edge set, validated to be a DAG at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitGraph {
    units: HashMap<String, LearningUnit>,
    /// unit id -> ids of units that depend on it
    dependents: HashMap<String, Vec<String>>,
}

impl UnitGraph {
    /// Validate and build a graph from units and extra edges.
    ///
    /// Edges declared on the units themselves (`prerequisites`) and the
    /// explicit `edges` argument are merged. Rejects duplicate unit ids,
    /// edges referencing unknown units, and cycles. A rejected graph is
    /// never partially constructed.
    pub fn build(
        units: Vec<LearningUnit>,
        edges: Vec<PrerequisiteEdge>,
    ) -> Result<Self, GraphError> {
        let mut by_id: HashMap<String, LearningUnit> = HashMap::with_capacity(units.len());
        for unit in units {
            if by_id.contains_key(&unit.id) {
                return Err(GraphError::DuplicateUnit(unit.id));
            }
            by_id.insert(unit.id.clone(), unit);
        }

        // Unit-declared prerequisite lists may repeat an id; collapse them
        // so in-degree accounting sees each edge once.
        for unit in by_id.values_mut() {
            let mut seen: HashSet<String> = HashSet::with_capacity(unit.prerequisites.len());
            unit.prerequisites.retain(|p| seen.insert(p.clone()));
        }

        for edge in edges {
            if !by_id.contains_key(&edge.unit) {
                return Err(GraphError::UnknownUnit(edge.unit));
            }
            let unit = by_id
                .get_mut(&edge.unit)
                .expect("presence checked above");
            if !unit.prerequisites.contains(&edge.prerequisite) {
                unit.prerequisites.push(edge.prerequisite);
            }
        }

        for unit in by_id.values() {
            for prereq in &unit.prerequisites {
                if !by_id.contains_key(prereq) {
                    return Err(GraphError::DanglingPrerequisite {
                        unit: unit.id.clone(),
                        prerequisite: prereq.clone(),
                    });
                }
            }
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::with_capacity(by_id.len());
        for id in by_id.keys() {
            dependents.insert(id.clone(), Vec::new());
        }
        for unit in by_id.values() {
            for prereq in &unit.prerequisites {
                dependents
                    .get_mut(prereq)
                    .expect("all prerequisites resolved above")
                    .push(unit.id.clone());
            }
        }

        detect_cycle(&by_id)?;

        Ok(Self {
            units: by_id,
            dependents,
        })
    }

    pub fn get(&self, unit_id: &str) -> Option<&LearningUnit> {
        self.units.get(unit_id)
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.units.contains_key(unit_id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> impl Iterator<Item = &LearningUnit> {
        self.units.values()
    }

    pub fn dependents_of(&self, unit_id: &str) -> &[String] {
        self.dependents
            .get(unit_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Units whose every prerequisite is completed or skipped, excluding
    /// units already settled themselves.
    ///
    /// Ordering is deterministic: declared stage order, then order index,
    /// then unit id. Identical inputs always yield the identical sequence.
    pub fn ready_set(&self, delta: &ProgressDelta) -> Vec<String> {
        let mut ready: Vec<&LearningUnit> = self
            .units
            .values()
            .filter(|unit| !delta.is_settled(&unit.id))
            .filter(|unit| unit.prerequisites.iter().all(|p| delta.is_settled(p)))
            .collect();

        ready.sort_by(|a, b| {
            a.stage
                .order()
                .cmp(&b.stage.order())
                .then(a.order_index.cmp(&b.order_index))
                .then(a.id.cmp(&b.id))
        });

        ready.into_iter().map(|unit| unit.id.clone()).collect()
    }

    /// True when a unit's prerequisites are all settled in `delta`.
    pub fn prerequisites_satisfied(&self, delta: &ProgressDelta, unit_id: &str) -> bool {
        match self.units.get(unit_id) {
            Some(unit) => unit.prerequisites.iter().all(|p| delta.is_settled(p)),
            None => false,
        }
    }

    /// Pure completion marker: returns a new delta, the input is untouched.
    pub fn mark_complete(
        &self,
        delta: &ProgressDelta,
        unit_id: &str,
    ) -> Result<ProgressDelta, GraphError> {
        if !self.contains(unit_id) {
            return Err(GraphError::UnknownUnit(unit_id.to_string()));
        }
        Ok(delta.with_completed(unit_id))
    }

    /// Pure skip marker: returns a new delta, the input is untouched.
    pub fn mark_skipped(
        &self,
        delta: &ProgressDelta,
        unit_id: &str,
    ) -> Result<ProgressDelta, GraphError> {
        if !self.contains(unit_id) {
            return Err(GraphError::UnknownUnit(unit_id.to_string()));
        }
        Ok(delta.with_skipped(unit_id))
    }

    /// True when every unit is completed or skipped.
    pub fn is_exhausted(&self, delta: &ProgressDelta) -> bool {
        self.units.keys().all(|id| delta.is_settled(id))
    }
}

/// Kahn's algorithm over the prerequisite edges. If a topological order
/// cannot consume every unit, the remainder contains a cycle, which is then
/// traced so the error can name its members.
fn detect_cycle(units: &HashMap<String, LearningUnit>) -> Result<(), GraphError> {
    let mut in_degree: HashMap<&str, usize> = units
        .iter()
        .map(|(id, unit)| (id.as_str(), unit.prerequisites.len()))
        .collect();

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0usize;
    while let Some(id) = queue.pop() {
        visited += 1;
        for unit in units.values() {
            if unit.prerequisites.iter().any(|p| p == id) {
                let degree = in_degree
                    .get_mut(unit.id.as_str())
                    .expect("every unit has an in-degree entry");
                *degree -= 1;
                if *degree == 0 {
                    queue.push(unit.id.as_str());
                }
            }
        }
    }

    if visited == units.len() {
        return Ok(());
    }

    let remaining: HashSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d > 0)
        .map(|(id, _)| *id)
        .collect();
    Err(GraphError::CyclicDependency {
        cycle: trace_cycle(units, &remaining),
    })
}

/// Walk prerequisite links inside the unresolved set until a node repeats,
/// then cut the walk down to the cycle itself (closed with the start node).
fn trace_cycle(units: &HashMap<String, LearningUnit>, remaining: &HashSet<&str>) -> Vec<String> {
    let start = match remaining.iter().min() {
        Some(id) => *id,
        None => return Vec::new(),
    };

    let mut path: Vec<&str> = vec![start];
    let mut seen: HashMap<&str, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let unit = &units[current];
        let next = unit
            .prerequisites
            .iter()
            .map(String::as_str)
            .filter(|p| remaining.contains(p))
            .min();
        let next = match next {
            Some(n) => n,
            None => return path.iter().map(|s| s.to_string()).collect(),
        };

        if let Some(&pos) = seen.get(next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(next.to_string());
            return cycle;
        }

        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::unit::UnitStage;

    fn unit(id: &str, stage: UnitStage, prereqs: &[&str]) -> LearningUnit {
        LearningUnit::new(id, stage, format!("Unit {id}"), "")
            .with_prerequisites(prereqs.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_build_valid_graph() {
        let graph = UnitGraph::build(
            vec![
                unit("a", UnitStage::Architecture, &[]),
                unit("b", UnitStage::Module, &["a"]),
                unit("c", UnitStage::Module, &["a"]),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependents_of("a").len(), 2);
    }

    #[test]
    fn test_explicit_edges_are_merged() {
        let graph = UnitGraph::build(
            vec![
                unit("a", UnitStage::Architecture, &[]),
                unit("b", UnitStage::Module, &[]),
            ],
            vec![PrerequisiteEdge::new("b", "a")],
        )
        .unwrap();

        assert_eq!(graph.get("b").unwrap().prerequisites, vec!["a"]);
    }

    #[test]
    fn test_repeated_declared_prerequisite_collapses() {
        let graph = UnitGraph::build(
            vec![
                unit("a", UnitStage::Architecture, &[]),
                unit("b", UnitStage::Module, &["a", "a"]),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(graph.get("b").unwrap().prerequisites, vec!["a"]);

        let delta = graph.mark_complete(&ProgressDelta::new(), "a").unwrap();
        assert_eq!(graph.ready_set(&delta), vec!["b"]);
    }

    #[test]
    fn test_cycle_is_rejected_and_named() {
        let result = UnitGraph::build(
            vec![
                unit("a", UnitStage::Architecture, &["c"]),
                unit("b", UnitStage::Module, &["a"]),
                unit("c", UnitStage::Class, &["b"]),
            ],
            vec![],
        );

        match result {
            Err(GraphError::CyclicDependency { cycle }) => {
                // Closed walk: first and last entries match.
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.len() >= 3);
                for id in &["a", "b", "c"] {
                    assert!(cycle.contains(&id.to_string()));
                }
            }
            other => panic!("expected cyclic dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_self_cycle_is_rejected() {
        let result = UnitGraph::build(vec![unit("a", UnitStage::Architecture, &["a"])], vec![]);
        assert!(matches!(
            result,
            Err(GraphError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_dangling_prerequisite_is_rejected() {
        let result = UnitGraph::build(vec![unit("a", UnitStage::Architecture, &["ghost"])], vec![]);
        assert_eq!(
            result.unwrap_err(),
            GraphError::DanglingPrerequisite {
                unit: "a".to_string(),
                prerequisite: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_edge_to_unknown_unit_is_rejected() {
        let result = UnitGraph::build(
            vec![unit("a", UnitStage::Architecture, &[])],
            vec![PrerequisiteEdge::new("ghost", "a")],
        );
        assert_eq!(result.unwrap_err(), GraphError::UnknownUnit("ghost".to_string()));
    }

    #[test]
    fn test_duplicate_unit_is_rejected() {
        let result = UnitGraph::build(
            vec![
                unit("a", UnitStage::Architecture, &[]),
                unit("a", UnitStage::Module, &[]),
            ],
            vec![],
        );
        assert_eq!(result.unwrap_err(), GraphError::DuplicateUnit("a".to_string()));
    }

    #[test]
    fn test_ready_set_progression() {
        let graph = UnitGraph::build(
            vec![
                unit("a", UnitStage::Architecture, &[]),
                unit("b", UnitStage::Module, &["a"]),
                unit("c", UnitStage::Module, &["a"]),
            ],
            vec![],
        )
        .unwrap();

        let delta = ProgressDelta::new();
        assert_eq!(graph.ready_set(&delta), vec!["a"]);

        let delta = graph.mark_complete(&delta, "a").unwrap();
        assert_eq!(graph.ready_set(&delta), vec!["b", "c"]);

        let delta = graph.mark_complete(&delta, "b").unwrap();
        let delta = graph.mark_skipped(&delta, "c").unwrap();
        assert!(graph.ready_set(&delta).is_empty());
        assert!(graph.is_exhausted(&delta));
    }

    #[test]
    fn test_ready_set_is_deterministic() {
        let units = vec![
            unit("z", UnitStage::Architecture, &[]),
            unit("m", UnitStage::Architecture, &[]),
            unit("a", UnitStage::Design, &[]),
        ];
        let graph = UnitGraph::build(units, vec![]).unwrap();
        let delta = ProgressDelta::new();

        let first = graph.ready_set(&delta);
        for _ in 0..10 {
            assert_eq!(graph.ready_set(&delta), first);
        }
        // Stage order before id order.
        assert_eq!(first, vec!["m", "z", "a"]);
    }

    #[test]
    fn test_order_index_breaks_ties_before_id() {
        let graph = UnitGraph::build(
            vec![
                unit("b", UnitStage::Module, &[]).with_order_index(0),
                unit("a", UnitStage::Module, &[]).with_order_index(1),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(graph.ready_set(&ProgressDelta::new()), vec!["b", "a"]);
    }

    #[test]
    fn test_skipped_satisfies_prerequisites() {
        let graph = UnitGraph::build(
            vec![
                unit("a", UnitStage::Architecture, &[]),
                unit("b", UnitStage::Module, &["a"]),
            ],
            vec![],
        )
        .unwrap();

        let delta = graph.mark_skipped(&ProgressDelta::new(), "a").unwrap();
        assert_eq!(graph.ready_set(&delta), vec!["b"]);
    }

    #[test]
    fn test_mark_is_pure() {
        let graph =
            UnitGraph::build(vec![unit("a", UnitStage::Architecture, &[])], vec![]).unwrap();
        let original = ProgressDelta::new();
        let updated = graph.mark_complete(&original, "a").unwrap();

        assert!(original.completed.is_empty());
        assert!(updated.completed.contains("a"));
    }

    #[test]
    fn test_mark_unknown_unit_errors() {
        let graph =
            UnitGraph::build(vec![unit("a", UnitStage::Architecture, &[])], vec![]).unwrap();
        assert!(graph
            .mark_complete(&ProgressDelta::new(), "ghost")
            .is_err());
    }
}
