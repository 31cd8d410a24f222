//! Worker agents: execute tasks, learn patterns, share them with the
//! collective and vote on what the collective should trust.

use crate::aggregation::PatternAggregator;
use crate::capability::{TaskOutcome, WorkerRole, WorkerSpec, WorkerStatus};
use crate::collaborators::{LearningPipeline, OutcomeRecord, PatternExtractor, TaskExecutor};
use crate::consensus::{Ballot, BallotRequest, ProposalType, Voter};
use crate::events::{EventBus, HiveEvent};
use crate::pattern::{PatternCandidate, PatternContribution, PatternDraft};
use crate::task::{Observation, Task, TaskReport};
use crate::types::{clamp_unit, HiveError, Result, Signature, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hivemind_store::{HiveStore, Namespace, StoreExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const INITIAL_PERFORMANCE: f64 = 0.5;

/// Instruction issued by the queen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "directive", content = "value", rename_all = "snake_case")]
pub enum Directive {
    Pause,
    Resume,
    SetSharing(bool),
    /// Narrow attention to one capability or task kind
    Focus(String),
}

/// Where a locally held pattern came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum PatternOrigin {
    Local,
    Collective { pattern_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalPattern {
    pub draft: PatternDraft,
    pub origin: PatternOrigin,
    pub learned_at: DateTime<Utc>,
}

/// Result of [`WorkerAgent::learn_pattern`].
#[derive(Debug, Clone, PartialEq)]
pub struct LearnOutcome {
    pub signature: Signature,

    /// Whether the aggregator accepted the contribution
    pub shared: bool,
}

/// Read-only snapshot of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: WorkerId,
    pub role: WorkerRole,
    pub capabilities: BTreeSet<String>,
    pub specializations: Vec<String>,
    pub learning_rate: f64,
    pub autonomy: f64,
    pub status: WorkerStatus,
    pub performance_score: f64,
    pub tasks_completed: u64,
    pub patterns_learned: u64,
    pub sharing_enabled: bool,
    pub focus: Option<String>,
    pub local_patterns: usize,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug)]
struct Runtime {
    status: WorkerStatus,
    performance_score: f64,
    tasks_completed: u64,
    patterns_learned: u64,
    sharing_enabled: bool,
    focus: Option<String>,
    last_heartbeat: DateTime<Utc>,
}

/// Shared services a worker is wired to.
#[derive(Clone)]
pub struct WorkerContext {
    pub executor: Arc<dyn TaskExecutor>,
    pub pipeline: Arc<dyn LearningPipeline>,
    pub extractor: Arc<dyn PatternExtractor>,
    pub aggregator: Arc<PatternAggregator>,
    pub store: Arc<dyn HiveStore>,
    pub events: EventBus,
    pub task_timeout: Duration,
}

pub struct WorkerAgent {
    id: WorkerId,
    role: WorkerRole,
    capabilities: BTreeSet<String>,
    specializations: Vec<String>,
    learning_rate: f64,
    autonomy: f64,
    runtime: RwLock<Runtime>,
    patterns: RwLock<HashMap<Signature, LocalPattern>>,
    ctx: WorkerContext,
}

impl WorkerAgent {
    /// Validate `spec` and build the worker. Registration with the queen
    /// and the consensus engine is done by the caller.
    pub async fn initialize(spec: WorkerSpec, ctx: WorkerContext) -> Result<Arc<Self>> {
        spec.validate()?;

        let worker = Arc::new(Self {
            capabilities: spec.effective_capabilities(),
            autonomy: spec.autonomy.unwrap_or_else(|| spec.role.default_autonomy()),
            id: spec.id,
            role: spec.role,
            specializations: spec.specializations,
            learning_rate: spec.learning_rate,
            runtime: RwLock::new(Runtime {
                status: WorkerStatus::Idle,
                performance_score: INITIAL_PERFORMANCE,
                tasks_completed: 0,
                patterns_learned: 0,
                sharing_enabled: spec.sharing_enabled,
                focus: None,
                last_heartbeat: Utc::now(),
            }),
            patterns: RwLock::new(HashMap::new()),
            ctx,
        });

        info!(worker_id = %worker.id, role = %worker.role, "Worker initialized");
        worker.persist().await;
        Ok(worker)
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub async fn status(&self) -> WorkerStatus {
        self.runtime.read().await.status
    }

    pub async fn performance_score(&self) -> f64 {
        self.runtime.read().await.performance_score
    }

    pub async fn last_heartbeat(&self) -> DateTime<Utc> {
        self.runtime.read().await.last_heartbeat
    }

    pub(crate) async fn set_status(&self, status: WorkerStatus) {
        self.runtime.write().await.status = status;
    }

    /// Execute `task` through the executor, capturing the run as an
    /// observation and folding the outcome into the performance score.
    pub async fn execute_task(&self, mut task: Task) -> Result<TaskReport> {
        {
            let mut runtime = self.runtime.write().await;
            if !runtime.status.can_vote() {
                return Err(HiveError::NoEligibleWorkers(format!(
                    "worker {} is {:?}",
                    self.id, runtime.status
                )));
            }
            runtime.status = WorkerStatus::Busy;
        }

        let suggestion = self
            .ctx
            .pipeline
            .get_best_pattern(&task.description, &task.params)
            .await;
        if suggestion.applied {
            task.applied_pattern = suggestion.pattern_id.clone();
        }

        info!(worker_id = %self.id, task_id = %task.id, kind = %task.kind, "Task started");
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();

        let outcome = match tokio::time::timeout(
            self.ctx.task_timeout,
            self.ctx.executor.execute(&self.id, &task),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => TaskOutcome::Failure {
                error: e.to_string(),
            },
            Err(_) => TaskOutcome::Failure {
                error: format!("timed out after {}ms", self.ctx.task_timeout.as_millis()),
            },
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let observation = Observation {
            task_id: task.id.clone(),
            worker_id: self.id.clone(),
            tool_name: task.kind.clone(),
            params: task.params.clone(),
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            success: outcome.is_success(),
            error: match &outcome {
                TaskOutcome::Failure { error } => Some(error.clone()),
                _ => None,
            },
            outcome: outcome.clone(),
        };
        self.ctx.pipeline.observe(&observation).await;

        let performance_score = {
            let mut runtime = self.runtime.write().await;
            runtime.performance_score = clamp_unit(
                runtime.performance_score * (1.0 - self.learning_rate)
                    + outcome.score() * self.learning_rate,
            );
            runtime.tasks_completed += 1;
            runtime.last_heartbeat = Utc::now();
            if runtime.status == WorkerStatus::Busy {
                runtime.status = WorkerStatus::Active;
            }
            runtime.performance_score
        };

        self.ctx
            .pipeline
            .track_outcome(&OutcomeRecord {
                task_id: task.id.clone(),
                worker_id: self.id.clone(),
                score: outcome.score(),
                pattern_id: task.applied_pattern.clone(),
            })
            .await;

        match &outcome {
            TaskOutcome::Failure { error } => {
                warn!(worker_id = %self.id, task_id = %task.id, duration_ms, error = %error, "Task failed")
            }
            _ => info!(worker_id = %self.id, task_id = %task.id, duration_ms, performance_score, "Task finished"),
        }

        if observation.success {
            if let Err(e) = self.learn_pattern(&observation).await {
                warn!(worker_id = %self.id, error = %e, "Pattern learning failed");
            }
        }

        self.persist().await;
        self.ctx.events.publish(HiveEvent::TaskCompleted {
            task_id: task.id.clone(),
            worker_id: self.id.clone(),
            success: outcome.is_success(),
            duration_ms,
        });

        Ok(TaskReport {
            task_id: task.id,
            worker_id: self.id.clone(),
            outcome,
            duration_ms,
            performance_score,
        })
    }

    /// Extract a pattern from `observation`, keep it locally and, when
    /// sharing is on, contribute it to the aggregator.
    pub async fn learn_pattern(&self, observation: &Observation) -> Result<Option<LearnOutcome>> {
        let Some(draft) = self.ctx.extractor.extract(observation).await else {
            debug!(worker_id = %self.id, task_id = %observation.task_id, "No pattern extracted");
            return Ok(None);
        };
        draft.validate()?;

        let signature = draft.signature();
        self.patterns.write().await.insert(
            signature.clone(),
            LocalPattern {
                draft: draft.clone(),
                origin: PatternOrigin::Local,
                learned_at: Utc::now(),
            },
        );
        self.ctx.pipeline.train(&draft).await;

        let (sharing, score) = {
            let mut runtime = self.runtime.write().await;
            runtime.patterns_learned += 1;
            (runtime.sharing_enabled, runtime.performance_score)
        };

        let mut shared = false;
        if sharing {
            let contribution = PatternContribution::new(self.id.clone(), self.role, draft, score);
            match self.ctx.aggregator.submit_pattern(contribution).await {
                Ok(_) => shared = true,
                Err(e) => warn!(worker_id = %self.id, signature = %signature, error = %e, "Contribution refused"),
            }
        }

        debug!(worker_id = %self.id, signature = %signature, shared, "Pattern learned");
        Ok(Some(LearnOutcome { signature, shared }))
    }

    /// Absorb validated patterns relevant to this worker. A held signature
    /// is replaced only by a strictly more confident collective version.
    pub async fn learn_from_collective(&self) -> Result<usize> {
        let relevant = self
            .ctx
            .aggregator
            .patterns_for(self.role, &self.specializations)
            .await;

        let mut absorbed = Vec::new();
        {
            let mut patterns = self.patterns.write().await;
            for validated in relevant {
                let better = patterns
                    .get(&validated.signature)
                    .map(|held| validated.confidence > held.draft.confidence)
                    .unwrap_or(true);
                if !better {
                    continue;
                }

                let mut draft = validated.pattern.clone();
                draft.confidence = validated.confidence;
                patterns.insert(
                    validated.signature.clone(),
                    LocalPattern {
                        draft: draft.clone(),
                        origin: PatternOrigin::Collective {
                            pattern_id: validated.id.clone(),
                        },
                        learned_at: Utc::now(),
                    },
                );
                absorbed.push(draft);
            }
        }

        for draft in &absorbed {
            self.ctx.pipeline.train(draft).await;
        }
        self.runtime.write().await.patterns_learned += absorbed.len() as u64;

        if !absorbed.is_empty() {
            info!(worker_id = %self.id, absorbed = absorbed.len(), "Learned from collective");
            self.persist().await;
        }
        Ok(absorbed.len())
    }

    pub async fn local_pattern(&self, signature: &str) -> Option<LocalPattern> {
        self.patterns.read().await.get(signature).cloned()
    }

    pub async fn get_state(&self) -> WorkerState {
        let local_patterns = self.patterns.read().await.len();
        let runtime = self.runtime.read().await;
        WorkerState {
            id: self.id.clone(),
            role: self.role,
            capabilities: self.capabilities.clone(),
            specializations: self.specializations.clone(),
            learning_rate: self.learning_rate,
            autonomy: self.autonomy,
            status: runtime.status,
            performance_score: runtime.performance_score,
            tasks_completed: runtime.tasks_completed,
            patterns_learned: runtime.patterns_learned,
            sharing_enabled: runtime.sharing_enabled,
            focus: runtime.focus.clone(),
            local_patterns,
            last_heartbeat: runtime.last_heartbeat,
        }
    }

    /// Apply a queen directive.
    pub async fn apply_directive(&self, directive: &Directive) -> Result<()> {
        let mut runtime = self.runtime.write().await;
        match directive {
            Directive::Pause => runtime.status = WorkerStatus::Paused,
            Directive::Resume => {
                if runtime.status == WorkerStatus::Offline {
                    return Err(HiveError::NoEligibleWorkers(format!(
                        "worker {} is offline",
                        self.id
                    )));
                }
                runtime.status = WorkerStatus::Active;
            }
            Directive::SetSharing(enabled) => runtime.sharing_enabled = *enabled,
            Directive::Focus(area) => runtime.focus = Some(area.clone()),
        }
        debug!(worker_id = %self.id, directive = ?directive, "Directive applied");
        Ok(())
    }

    /// Report liveness. An offline worker comes back as idle.
    pub async fn heartbeat(&self) {
        let mut runtime = self.runtime.write().await;
        runtime.last_heartbeat = Utc::now();
        if runtime.status == WorkerStatus::Offline {
            runtime.status = WorkerStatus::Idle;
        }
    }

    async fn persist(&self) {
        let state = self.get_state().await;
        if let Err(e) = self
            .ctx
            .store
            .put_record(Namespace::HiveWorkers, &self.id, &state, None)
            .await
        {
            warn!(worker_id = %self.id, error = %e, "Failed to persist worker state");
        }
    }
}

#[async_trait]
impl Voter for WorkerAgent {
    async fn cast_vote(&self, request: &BallotRequest) -> Option<Ballot> {
        let (status, performance) = {
            let runtime = self.runtime.read().await;
            (runtime.status, runtime.performance_score)
        };
        if !status.can_vote() {
            return None;
        }
        let confidence = 0.5 + performance / 2.0;

        match &request.proposal_type {
            ProposalType::PatternValidation => {
                let candidate: PatternCandidate = serde_json::from_value(request.payload.clone()).ok()?;
                let held = self
                    .patterns
                    .read()
                    .await
                    .get(&candidate.signature)
                    .map(|p| p.draft.confidence);
                let (value, reason) = match held {
                    Some(local) => (
                        (candidate.draft.confidence + local) / 2.0,
                        "blended with local experience",
                    ),
                    None => (candidate.draft.confidence, "candidate confidence"),
                };
                Some(Ballot::new(value, confidence, reason))
            }
            _ => Some(Ballot::new(1.0, confidence, "available")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusEngine;
    use crate::lifecycle::Lifecycle;
    use crate::pattern::PatternAction;
    use crate::test_utils::{failure, partial, FixedExtractor, RecordingPipeline, ScriptedExecutor, ScriptedVoter};
    use hivemind_config::{AggregationConfig, ConsensusConfig};
    use hivemind_store::MemoryStore;

    struct Fixture {
        consensus: Arc<ConsensusEngine>,
        aggregator: Arc<PatternAggregator>,
        pipeline: Arc<RecordingPipeline>,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        async fn new() -> Self {
            let events = EventBus::default();
            let lifecycle = Lifecycle::new();
            let consensus = Arc::new(ConsensusEngine::new(
                ConsensusConfig::default(),
                events.clone(),
                lifecycle.clone(),
            ));
            for id in ["v-1", "v-2", "v-3"] {
                consensus
                    .register_node(id, Arc::new(ScriptedVoter::voting(1.0, 0.8)))
                    .await
                    .unwrap();
            }
            let store = Arc::new(MemoryStore::new());
            let aggregator = Arc::new(PatternAggregator::new(
                AggregationConfig::default(),
                Arc::clone(&consensus),
                store.clone(),
                events,
                lifecycle,
            ));
            Self {
                consensus,
                aggregator,
                pipeline: Arc::new(RecordingPipeline::new()),
                store,
            }
        }

        fn context(&self, executor: ScriptedExecutor, extractor: FixedExtractor) -> WorkerContext {
            WorkerContext {
                executor: Arc::new(executor),
                pipeline: self.pipeline.clone(),
                extractor: Arc::new(extractor),
                aggregator: Arc::clone(&self.aggregator),
                store: self.store.clone(),
                events: EventBus::default(),
                task_timeout: Duration::from_secs(5),
            }
        }
    }

    fn draft(confidence: f64) -> PatternDraft {
        PatternDraft::new("bugfix", vec![PatternAction::new("read"), PatternAction::new("fix")])
            .with_confidence(confidence)
            .with_quality(0.8)
    }

    #[tokio::test]
    async fn test_performance_moving_average() {
        let fx = Fixture::new().await;
        let executor = ScriptedExecutor::succeeding()
            .with_outcome("w-2", partial("half done"))
            .with_outcome("w-3", failure("boom"));

        let spec = |id: &str| WorkerSpec::new(id, WorkerRole::Implementer).with_learning_rate(0.2);
        let ctx = fx.context(executor, FixedExtractor::empty());
        let w1 = WorkerAgent::initialize(spec("w-1"), ctx.clone()).await.unwrap();
        let w2 = WorkerAgent::initialize(spec("w-2"), ctx.clone()).await.unwrap();
        let w3 = WorkerAgent::initialize(spec("w-3"), ctx).await.unwrap();

        let r1 = w1.execute_task(Task::new("bugfix", "fix it")).await.unwrap();
        let r2 = w2.execute_task(Task::new("bugfix", "fix it")).await.unwrap();
        let r3 = w3.execute_task(Task::new("bugfix", "fix it")).await.unwrap();

        assert!((r1.performance_score - 0.6).abs() < 1e-9);
        assert!((r2.performance_score - 0.5).abs() < 1e-9);
        assert!((r3.performance_score - 0.4).abs() < 1e-9);

        let state = w1.get_state().await;
        assert_eq!(state.tasks_completed, 1);
        assert_eq!(state.status, WorkerStatus::Active);
        assert_eq!(fx.store.len(Namespace::HiveWorkers).await, 3);
    }

    #[tokio::test]
    async fn test_executor_error_is_captured_as_observation() {
        let fx = Fixture::new().await;
        let executor = ScriptedExecutor::succeeding().with_error("w-1", "executor crashed");
        let worker = WorkerAgent::initialize(
            WorkerSpec::new("w-1", WorkerRole::Tester),
            fx.context(executor, FixedExtractor::empty()),
        )
        .await
        .unwrap();

        let report = worker.execute_task(Task::new("test", "run suite")).await.unwrap();
        assert!(!report.is_success());

        let observations = fx.pipeline.observations().await;
        assert_eq!(observations.len(), 1);
        assert!(!observations[0].success);
        assert_eq!(observations[0].error.as_deref(), Some("executor crashed"));
        assert_eq!(fx.pipeline.outcomes().await[0].score, 0.0);
    }

    #[tokio::test]
    async fn test_performance_stays_in_unit_interval() {
        let fx = Fixture::new().await;
        let worker = WorkerAgent::initialize(
            WorkerSpec::new("w-1", WorkerRole::Tester).with_learning_rate(0.3),
            fx.context(ScriptedExecutor::succeeding(), FixedExtractor::empty()),
        )
        .await
        .unwrap();

        for _ in 0..50 {
            let report = worker.execute_task(Task::new("test", "run")).await.unwrap();
            assert!((0.0..=1.0).contains(&report.performance_score));
        }
    }

    #[tokio::test]
    async fn test_learn_pattern_respects_sharing() {
        let fx = Fixture::new().await;
        let sharing = WorkerAgent::initialize(
            WorkerSpec::new("w-1", WorkerRole::Implementer),
            fx.context(ScriptedExecutor::succeeding(), FixedExtractor::new(draft(0.7))),
        )
        .await
        .unwrap();
        let private = WorkerAgent::initialize(
            WorkerSpec::new("w-2", WorkerRole::Implementer).with_sharing(false),
            fx.context(ScriptedExecutor::succeeding(), FixedExtractor::new(draft(0.7))),
        )
        .await
        .unwrap();

        sharing.execute_task(Task::new("bugfix", "fix")).await.unwrap();
        private.execute_task(Task::new("bugfix", "fix")).await.unwrap();

        let signature = draft(0.7).signature();
        assert!(sharing.local_pattern(&signature).await.is_some());
        assert!(private.local_pattern(&signature).await.is_some());
        assert_eq!(fx.aggregator.pending_contributions(&signature).await, 1);
        assert_eq!(fx.pipeline.trained().await.len(), 2);
    }

    #[tokio::test]
    async fn test_learn_from_collective_only_upgrades() {
        let fx = Fixture::new().await;
        for id in ["v-1", "v-2"] {
            fx.aggregator
                .submit_pattern(PatternContribution::new(id, WorkerRole::Reviewer, draft(0.8), 1.0))
                .await
                .unwrap();
        }
        assert_eq!(fx.aggregator.run_cycle().await.unwrap().validated.len(), 1);
        let signature = draft(0.8).signature();

        let novice = WorkerAgent::initialize(
            WorkerSpec::new("w-1", WorkerRole::Implementer).with_sharing(false),
            fx.context(ScriptedExecutor::succeeding(), FixedExtractor::new(draft(0.5))),
        )
        .await
        .unwrap();
        let expert = WorkerAgent::initialize(
            WorkerSpec::new("w-2", WorkerRole::Implementer).with_sharing(false),
            fx.context(ScriptedExecutor::succeeding(), FixedExtractor::new(draft(0.95))),
        )
        .await
        .unwrap();
        novice.execute_task(Task::new("bugfix", "fix")).await.unwrap();
        expert.execute_task(Task::new("bugfix", "fix")).await.unwrap();

        assert_eq!(novice.learn_from_collective().await.unwrap(), 1);
        assert_eq!(expert.learn_from_collective().await.unwrap(), 0);

        let held = novice.local_pattern(&signature).await.unwrap();
        assert!((held.draft.confidence - 0.8).abs() < 1e-9);
        assert!(matches!(held.origin, PatternOrigin::Collective { .. }));
        assert_eq!(
            expert.local_pattern(&signature).await.unwrap().origin,
            PatternOrigin::Local
        );
        assert!(fx.consensus.node_count().await >= 3);
    }

    #[tokio::test]
    async fn test_directives_and_voting() {
        let fx = Fixture::new().await;
        let worker = WorkerAgent::initialize(
            WorkerSpec::new("w-1", WorkerRole::Reviewer),
            fx.context(ScriptedExecutor::succeeding(), FixedExtractor::empty()),
        )
        .await
        .unwrap();

        let request = BallotRequest {
            proposal_id: "p-1".to_string(),
            proposal_type: ProposalType::PatternValidation,
            payload: serde_json::to_value(PatternCandidate {
                signature: draft(0.9).signature(),
                draft: draft(0.9),
                contributors: vec!["a".to_string(), "b".to_string()],
                strategy: crate::pattern::ResolutionStrategy::Merge,
            })
            .unwrap(),
            round: 1,
            node_id: "w-1".to_string(),
        };

        let ballot = worker.cast_vote(&request).await.unwrap();
        assert!((ballot.value - 0.9).abs() < 1e-9);
        assert!((ballot.justification.confidence - 0.75).abs() < 1e-9);

        worker.apply_directive(&Directive::Pause).await.unwrap();
        assert!(worker.cast_vote(&request).await.is_none());
        assert!(worker.execute_task(Task::new("review", "look")).await.is_err());

        worker.apply_directive(&Directive::Resume).await.unwrap();
        worker.apply_directive(&Directive::SetSharing(false)).await.unwrap();
        worker
            .apply_directive(&Directive::Focus("security".to_string()))
            .await
            .unwrap();

        let state = worker.get_state().await;
        assert_eq!(state.status, WorkerStatus::Active);
        assert!(!state.sharing_enabled);
        assert_eq!(state.focus.as_deref(), Some("security"));

        let garbage = BallotRequest {
            payload: serde_json::json!({"not": "a candidate"}),
            ..request
        };
        assert!(worker.cast_vote(&garbage).await.is_none());
    }
}
