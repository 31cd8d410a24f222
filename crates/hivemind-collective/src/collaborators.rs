//! Interfaces to the systems the hive consumes but does not implement:
//! task execution, the learning pipeline and pattern extraction.

use crate::capability::TaskOutcome;
use crate::pattern::PatternDraft;
use crate::task::{Observation, Task};
use crate::types::{TaskId, WorkerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Executes a task on behalf of a worker.
///
/// An `Err` is recorded as a failed outcome; it never aborts other workers.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, worker_id: &WorkerId, task: &Task) -> anyhow::Result<TaskOutcome>;
}

/// Outcome fed back to the learning pipeline after every task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub score: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
}

/// Pattern suggestion for an upcoming task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BestPattern {
    pub applied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BestPattern {
    pub fn not_applied(reason: impl Into<String>) -> Self {
        Self {
            applied: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait LearningPipeline: Send + Sync {
    async fn observe(&self, observation: &Observation);

    async fn train(&self, pattern: &PatternDraft);

    async fn track_outcome(&self, outcome: &OutcomeRecord);

    async fn get_best_pattern(&self, task_description: &str, context: &serde_json::Value)
        -> BestPattern;
}

/// Turns an observation into a candidate pattern, if there is one.
#[async_trait]
pub trait PatternExtractor: Send + Sync {
    async fn extract(&self, observation: &Observation) -> Option<PatternDraft>;
}

/// Pipeline that learns nothing. Used when the hive runs without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLearningPipeline;

#[async_trait]
impl LearningPipeline for NoopLearningPipeline {
    async fn observe(&self, _observation: &Observation) {}

    async fn train(&self, _pattern: &PatternDraft) {}

    async fn track_outcome(&self, _outcome: &OutcomeRecord) {}

    async fn get_best_pattern(
        &self,
        _task_description: &str,
        _context: &serde_json::Value,
    ) -> BestPattern {
        BestPattern::not_applied("no learning pipeline configured")
    }
}

/// Extractor that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPatternExtractor;

#[async_trait]
impl PatternExtractor for NoopPatternExtractor {
    async fn extract(&self, _observation: &Observation) -> Option<PatternDraft> {
        None
    }
}
