//! Core data types shared across the queue, workers, economics, and
//! resilience layers: subtasks, task state, worker specs, and the
//! artifacts (references, findings, claims) that survive a run.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a subtask. Carried verbatim from decomposition
/// through checkpoints, so it is a newtype over `String` rather than a
/// generated id -- it must round-trip byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubtaskId(pub String);

impl SubtaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubtaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubtaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque identifier for an LLM model/provider backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The kind of work a subtask represents. Used both for worker capability
/// routing and for auto-split eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskType {
    Research,
    Implement,
    Test,
    Review,
    Document,
    Refactor,
    Verify,
}

impl fmt::Display for SubtaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Research => "research",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::Review => "review",
            Self::Document => "document",
            Self::Refactor => "refactor",
            Self::Verify => "verify",
        };
        write!(f, "{s}")
    }
}

/// Semantic identity of a unit of work, as produced by decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: SubtaskType,
    pub dependencies: BTreeSet<SubtaskId>,
    /// 1-10.
    pub complexity: u8,
    pub parallelizable: bool,
    /// Advisory; not authoritative for conflict detection.
    pub relevant_files: Vec<String>,
}

impl Subtask {
    pub fn new(id: impl Into<SubtaskId>, description: impl Into<String>, task_type: SubtaskType) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            task_type,
            dependencies: BTreeSet::new(),
            complexity: 5,
            parallelizable: true,
            relevant_files: Vec::new(),
        }
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = SubtaskId>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity.clamp(1, 10);
        self
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = String>) -> Self {
        self.relevant_files = files.into_iter().collect();
        self
    }
}

/// The lifecycle status of a subtask in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Dispatched,
    Completed,
    Failed,
    Skipped,
}

/// Why a dispatched task failed. Drives both health tracking and the
/// partial-dependency threshold table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    Timeout,
    RateLimit,
    Error,
    Quality,
    Hollow,
    Cascade,
}

impl FailureMode {
    /// The most lenient (lowest) partial-dependency threshold this failure
    /// mode permits downstream tasks to proceed at.
    pub fn leniency_threshold(self) -> f64 {
        match self {
            Self::Timeout => 0.3,
            Self::RateLimit => 0.3,
            Self::Error => 0.5,
            Self::Quality => 0.7,
            Self::Hollow => 0.7,
            Self::Cascade => 0.8,
        }
    }
}

/// Metadata attached to a task dispatched with only a subset of its
/// dependencies completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialContext {
    pub succeeded: Vec<SubtaskId>,
    pub failed: Vec<(SubtaskId, FailureMode)>,
}

/// A configured agent worker: a name, the model it calls, and the
/// capabilities (subtask types) it can serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub model: ModelId,
    pub capabilities: BTreeSet<SubtaskType>,
    pub context_window: u32,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, model: impl Into<ModelId>, capabilities: impl IntoIterator<Item = SubtaskType>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            capabilities: capabilities.into_iter().collect(),
            context_window: 200_000,
        }
    }
}

/// The kind of artifact a [`Reference`] preserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    File,
    Url,
    Function,
    Error,
    Command,
    Decision,
}

/// A preserved artifact surviving context compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    pub kind: ReferenceKind,
    pub value: String,
    pub context: Option<String>,
    pub source_index: Option<usize>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
