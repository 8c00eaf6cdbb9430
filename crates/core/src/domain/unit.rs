use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Learning stage a unit belongs to. The declared order here is the primary
/// scheduling key for the ready-set, so it must stay stable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitStage {
    #[default]
    Architecture,
    Module,
    Class,
    Method,
    Design,
}

impl UnitStage {
    pub const ALL: [UnitStage; 5] = [
        Self::Architecture,
        Self::Module,
        Self::Class,
        Self::Method,
        Self::Design,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architecture => "architecture",
            Self::Module => "module",
            Self::Class => "class",
            Self::Method => "method",
            Self::Design => "design",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "architecture" => Some(Self::Architecture),
            "module" => Some(Self::Module),
            "class" => Some(Self::Class),
            "method" => Some(Self::Method),
            "design" => Some(Self::Design),
            _ => None,
        }
    }

    /// Position in the declared stage order.
    pub fn order(&self) -> usize {
        match self {
            Self::Architecture => 0,
            Self::Module => 1,
            Self::Class => 2,
            Self::Method => 3,
            Self::Design => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
    Expert,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
            Self::Expert => "expert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "beginner" => Some(Self::Beginner),
            "intermediate" => Some(Self::Intermediate),
            "advanced" => Some(Self::Advanced),
            "expert" => Some(Self::Expert),
            _ => None,
        }
    }
}

/// Question payload carried by question-type units. Expected answer points
/// feed the tutor's evaluation; hints and recommended files are surfaced to
/// the learner on request.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct QuestionSpec {
    pub expected_points: Vec<String>,
    pub hints: Vec<String>,
    pub recommended_files: Vec<String>,
}

/// One scheduled item of work in the learning graph.
///
/// Title and description are templates with `{name}` placeholders filled in
/// from project metadata when the planner instantiates the unit. A unit is
/// resolved once no placeholders remain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningUnit {
    pub id: String,
    pub stage: UnitStage,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    pub prerequisites: Vec<String>,
    pub tags: Vec<String>,
    /// Capability that executes this unit (e.g. "tutor", "generator").
    pub capability: String,
    /// Capability-module tag for capability-focused sessions.
    pub capability_module: Option<String>,
    /// Whether dispatching this unit requires human approval.
    pub requires_approval: bool,
    /// Ordering index within the unit's stage.
    pub order_index: u32,
    pub question: Option<QuestionSpec>,
}

impl LearningUnit {
    pub fn new(
        id: impl Into<String>,
        stage: UnitStage,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            stage,
            title: title.into(),
            description: description.into(),
            difficulty: Difficulty::default(),
            prerequisites: Vec::new(),
            tags: Vec::new(),
            capability: "tutor".to_string(),
            capability_module: None,
            requires_approval: false,
            order_index: 0,
            question: None,
        }
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<String>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    pub fn with_capability_module(mut self, module: impl Into<String>) -> Self {
        self.capability_module = Some(module.into());
        self
    }

    pub fn with_approval_required(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_order_index(mut self, index: u32) -> Self {
        self.order_index = index;
        self
    }

    pub fn with_question(mut self, question: QuestionSpec) -> Self {
        self.question = Some(question);
        self
    }

    pub fn is_question(&self) -> bool {
        self.question.is_some()
    }

    /// Fill `{name}` placeholders in the title and description templates.
    /// Unknown placeholders are left intact so `is_resolved` reports them.
    pub fn resolve(mut self, vars: &HashMap<String, String>) -> Self {
        self.title = render_template(&self.title, vars);
        self.description = render_template(&self.description, vars);
        self
    }

    /// A unit is resolved once no placeholders remain in its templates.
    pub fn is_resolved(&self) -> bool {
        unresolved_placeholders(&self.title).is_empty()
            && unresolved_placeholders(&self.description).is_empty()
    }

    pub fn unresolved_placeholders(&self) -> Vec<String> {
        let mut names = unresolved_placeholders(&self.title);
        for name in unresolved_placeholders(&self.description) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

fn unresolved_placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let tail = &rest[open + 1..];
        match tail.find('}') {
            Some(close) => {
                let name = &tail[..close];
                if !name.is_empty() && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                rest = &tail[close + 1..];
            }
            None => break,
        }
    }
    names
}
