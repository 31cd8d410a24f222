//! Tasks and the observations captured around their execution.

use crate::capability::TaskOutcome;
use crate::types::{TaskId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Priority level for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Relative share used by proportional allocation.
    pub fn weight(&self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

/// A unit of work handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Kind of work, e.g. "bugfix"; reported as the observation's tool name
    pub kind: String,

    pub description: String,

    /// Capabilities a worker must hold to be selected
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,

    #[serde(default)]
    pub priority: TaskPriority,

    #[serde(default)]
    pub params: serde_json::Value,

    /// Pattern the learning pipeline suggested for this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_pattern: Option<String>,
}

impl Task {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kind: kind.into(),
            description: description.into(),
            required_capabilities: BTreeSet::new(),
            priority: TaskPriority::Normal,
            params: serde_json::Value::Null,
            applied_pattern: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Execution trace forwarded to the learning pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub tool_name: String,
    pub params: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub outcome: TaskOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a worker reports back for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,

    /// Performance score after this task
    pub performance_score: f64,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}
