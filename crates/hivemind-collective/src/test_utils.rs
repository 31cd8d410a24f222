//! Deterministic collaborators for tests.
//!
//! Enabled for this crate's own tests and, through the `test-utils`
//! feature, for downstream integration tests.

use crate::capability::TaskOutcome;
use crate::collaborators::{BestPattern, LearningPipeline, OutcomeRecord, PatternExtractor, TaskExecutor};
use crate::consensus::{Ballot, BallotRequest, Voter};
use crate::pattern::PatternDraft;
use crate::task::{Observation, Task};
use crate::types::WorkerId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
enum VoterBehaviour {
    Vote(Ballot),
    Abstain,
    Silent,
    Delayed(Duration, Ballot),
    FirstRoundOnly(Ballot),
}

/// Voter that always answers the same way.
#[derive(Debug)]
pub struct ScriptedVoter {
    behaviour: VoterBehaviour,
    calls: AtomicUsize,
}

impl ScriptedVoter {
    fn with(behaviour: VoterBehaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn voting(value: f64, confidence: f64) -> Self {
        Self::with(VoterBehaviour::Vote(Ballot::new(value, confidence, "scripted")))
    }

    /// Answers `None` straight away.
    pub fn abstaining() -> Self {
        Self::with(VoterBehaviour::Abstain)
    }

    /// Never answers; the round timeout turns it into an abstention.
    pub fn silent() -> Self {
        Self::with(VoterBehaviour::Silent)
    }

    pub fn delayed(delay: Duration, value: f64, confidence: f64) -> Self {
        Self::with(VoterBehaviour::Delayed(
            delay,
            Ballot::new(value, confidence, "scripted"),
        ))
    }

    /// Votes in the first round, then never answers again.
    pub fn first_round_only(value: f64, confidence: f64) -> Self {
        Self::with(VoterBehaviour::FirstRoundOnly(Ballot::new(value, confidence, "scripted")))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Voter for ScriptedVoter {
    async fn cast_vote(&self, request: &BallotRequest) -> Option<Ballot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            VoterBehaviour::Vote(ballot) => Some(ballot.clone()),
            VoterBehaviour::Abstain => None,
            VoterBehaviour::Silent => std::future::pending().await,
            VoterBehaviour::Delayed(delay, ballot) => {
                tokio::time::sleep(*delay).await;
                Some(ballot.clone())
            }
            VoterBehaviour::FirstRoundOnly(ballot) if request.round == 1 => Some(ballot.clone()),
            VoterBehaviour::FirstRoundOnly(_) => std::future::pending().await,
        }
    }
}

pub fn success() -> TaskOutcome {
    TaskOutcome::Success {
        output: serde_json::json!({"ok": true}),
    }
}

pub fn partial(reason: &str) -> TaskOutcome {
    TaskOutcome::Partial {
        output: serde_json::Value::Null,
        reason: reason.to_string(),
    }
}

pub fn failure(error: &str) -> TaskOutcome {
    TaskOutcome::Failure {
        error: error.to_string(),
    }
}

/// Executor with a per-worker script; unscripted workers get the default.
#[derive(Debug)]
pub struct ScriptedExecutor {
    default: std::result::Result<TaskOutcome, String>,
    outcomes: HashMap<WorkerId, std::result::Result<TaskOutcome, String>>,
    delays: HashMap<WorkerId, Duration>,
    calls: Mutex<Vec<WorkerId>>,
}

impl ScriptedExecutor {
    pub fn new(default: TaskOutcome) -> Self {
        Self {
            default: Ok(default),
            outcomes: HashMap::new(),
            delays: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(success())
    }

    pub fn with_outcome(mut self, worker_id: &str, outcome: TaskOutcome) -> Self {
        self.outcomes.insert(worker_id.to_string(), Ok(outcome));
        self
    }

    /// Make the executor itself fail for `worker_id`.
    pub fn with_error(mut self, worker_id: &str, error: &str) -> Self {
        self.outcomes.insert(worker_id.to_string(), Err(error.to_string()));
        self
    }

    pub fn with_delay(mut self, worker_id: &str, delay: Duration) -> Self {
        self.delays.insert(worker_id.to_string(), delay);
        self
    }

    /// Workers the executor was called for, in call order.
    pub async fn calls(&self) -> Vec<WorkerId> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, worker_id: &WorkerId, _task: &Task) -> anyhow::Result<TaskOutcome> {
        self.calls.lock().await.push(worker_id.clone());
        if let Some(delay) = self.delays.get(worker_id) {
            tokio::time::sleep(*delay).await;
        }
        match self.outcomes.get(worker_id).unwrap_or(&self.default) {
            Ok(outcome) => Ok(outcome.clone()),
            Err(error) => Err(anyhow::anyhow!("{error}")),
        }
    }
}

/// Extractor that returns the same draft for every observation.
#[derive(Debug, Clone, Default)]
pub struct FixedExtractor {
    draft: Option<PatternDraft>,
}

impl FixedExtractor {
    pub fn new(draft: PatternDraft) -> Self {
        Self { draft: Some(draft) }
    }

    pub fn empty() -> Self {
        Self { draft: None }
    }
}

#[async_trait]
impl PatternExtractor for FixedExtractor {
    async fn extract(&self, _observation: &Observation) -> Option<PatternDraft> {
        self.draft.clone()
    }
}

/// Pipeline that records every call.
#[derive(Debug, Default)]
pub struct RecordingPipeline {
    observations: Mutex<Vec<Observation>>,
    trained: Mutex<Vec<PatternDraft>>,
    outcomes: Mutex<Vec<OutcomeRecord>>,
    suggestion: Option<BestPattern>,
}

impl RecordingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suggest `pattern_id` for every task.
    pub fn suggesting(pattern_id: &str, confidence: f64) -> Self {
        Self {
            suggestion: Some(BestPattern {
                applied: true,
                pattern_id: Some(pattern_id.to_string()),
                confidence: Some(confidence),
                reason: None,
            }),
            ..Self::default()
        }
    }

    pub async fn observations(&self) -> Vec<Observation> {
        self.observations.lock().await.clone()
    }

    pub async fn trained(&self) -> Vec<PatternDraft> {
        self.trained.lock().await.clone()
    }

    pub async fn outcomes(&self) -> Vec<OutcomeRecord> {
        self.outcomes.lock().await.clone()
    }
}

#[async_trait]
impl LearningPipeline for RecordingPipeline {
    async fn observe(&self, observation: &Observation) {
        self.observations.lock().await.push(observation.clone());
    }

    async fn train(&self, pattern: &PatternDraft) {
        self.trained.lock().await.push(pattern.clone());
    }

    async fn track_outcome(&self, outcome: &OutcomeRecord) {
        self.outcomes.lock().await.push(outcome.clone());
    }

    async fn get_best_pattern(
        &self,
        _task_description: &str,
        _context: &serde_json::Value,
    ) -> BestPattern {
        self.suggestion
            .clone()
            .unwrap_or_else(|| BestPattern::not_applied("nothing recorded yet"))
    }
}
