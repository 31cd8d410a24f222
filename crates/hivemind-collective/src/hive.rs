//! The hive-mind coordinator: the public entry point wiring the queen,
//! workers, consensus engine and pattern aggregator together.

use crate::aggregation::{AggregatorMetrics, PatternAggregator};
use crate::capability::WorkerSpec;
use crate::collaborators::{
    LearningPipeline, NoopLearningPipeline, NoopPatternExtractor, PatternExtractor, TaskExecutor,
};
use crate::consensus::{ConsensusEngine, ConsensusMetrics};
use crate::events::EventBus;
use crate::lifecycle::Lifecycle;
use crate::orchestration::{self, OrchestrationOptions, OrchestrationResult};
use crate::queen::QueenCoordinator;
use crate::task::Task;
use crate::types::{clamp_unit, HiveError, Result};
use crate::worker::{WorkerAgent, WorkerContext};
use hivemind_config::{CollectiveIntelligenceWeights, HiveConfig};
use hivemind_store::HiveStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// External systems the hive drives but does not implement.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn TaskExecutor>,
    pub pipeline: Arc<dyn LearningPipeline>,
    pub extractor: Arc<dyn PatternExtractor>,
}

impl Collaborators {
    /// Run tasks through `executor` with no learning pipeline or extractor.
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            pipeline: Arc::new(NoopLearningPipeline),
            extractor: Arc::new(NoopPatternExtractor),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn LearningPipeline>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PatternExtractor>) -> Self {
        self.extractor = extractor;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HiveStatus {
    pub queen_active: bool,
    pub worker_count: usize,
    pub active_worker_count: usize,
    pub patterns_aggregated: u64,
    pub consensus_node_count: usize,
    pub collective_intelligence_score: f64,
}

/// Blend pattern growth, worker performance and node reputation into one
/// score in `[0, 1]`. Growth saturates as `g / (1 + g)`.
pub fn collective_intelligence_score(
    weights: &CollectiveIntelligenceWeights,
    growth_rate: f64,
    average_performance: f64,
    average_reputation: f64,
) -> f64 {
    let total = weights.growth + weights.performance + weights.reputation;
    if total <= 0.0 {
        return 0.0;
    }
    let growth = growth_rate.max(0.0) / (1.0 + growth_rate.max(0.0));
    clamp_unit(
        (weights.growth * growth
            + weights.performance * average_performance
            + weights.reputation * average_reputation)
            / total,
    )
}

pub struct HiveMind {
    config: HiveConfig,
    store: Arc<dyn HiveStore>,
    events: EventBus,
    lifecycle: Lifecycle,
    consensus: Arc<ConsensusEngine>,
    aggregator: Arc<PatternAggregator>,
    queen: Arc<QueenCoordinator>,
    aggregation_loop: Mutex<Option<JoinHandle<()>>>,
    intelligence: RwLock<f64>,
}

impl HiveMind {
    /// Validate `config`, check the store, reload the collective library,
    /// crown the queen and start the aggregation loop.
    ///
    /// Configuration errors and an unreachable store are fatal here.
    pub async fn initialize(
        store: Arc<dyn HiveStore>,
        config: HiveConfig,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        store.health_check().await?;

        let events = EventBus::default();
        let lifecycle = Lifecycle::new();
        let consensus = Arc::new(ConsensusEngine::new(
            config.consensus.clone(),
            events.clone(),
            lifecycle.clone(),
        ));
        let aggregator = Arc::new(PatternAggregator::new(
            config.aggregation.clone(),
            Arc::clone(&consensus),
            Arc::clone(&store),
            events.clone(),
            lifecycle.clone(),
        ));
        aggregator.load_library().await?;

        let worker_ctx = WorkerContext {
            executor: collaborators.executor,
            pipeline: collaborators.pipeline,
            extractor: collaborators.extractor,
            aggregator: Arc::clone(&aggregator),
            store: Arc::clone(&store),
            events: events.clone(),
            task_timeout: config.orchestration.task_timeout(),
        };
        let queen = QueenCoordinator::new(
            config.clone(),
            Arc::clone(&consensus),
            worker_ctx,
            lifecycle.child(),
        )
        .await?;
        queen.establish_sovereignty().await?;

        let aggregation_loop = aggregator.start();

        info!(
            max_workers = config.max_workers,
            aggregation_interval_ms = config.aggregation.interval_ms,
            "Hive mind initialized"
        );

        Ok(Arc::new(Self {
            config,
            store,
            events,
            lifecycle,
            consensus,
            aggregator,
            queen,
            aggregation_loop: Mutex::new(Some(aggregation_loop)),
            intelligence: RwLock::new(0.0),
        }))
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn HiveStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queen(&self) -> &Arc<QueenCoordinator> {
        &self.queen
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn aggregator(&self) -> &Arc<PatternAggregator> {
        &self.aggregator
    }

    pub async fn workers(&self) -> Vec<Arc<WorkerAgent>> {
        self.queen.workers().await
    }

    pub async fn spawn_worker(&self, spec: WorkerSpec) -> Result<Arc<WorkerAgent>> {
        if self.lifecycle.is_shutting_down() {
            return Err(HiveError::ShuttingDown);
        }
        self.queen.register_worker(spec).await
    }

    /// Select eligible workers and run `description` on them with the
    /// requested strategy.
    pub async fn orchestrate_task(
        &self,
        description: &str,
        options: OrchestrationOptions,
    ) -> Result<OrchestrationResult> {
        if self.lifecycle.is_shutting_down() {
            return Err(HiveError::ShuttingDown);
        }

        let mut task = Task::new(options.kind.clone(), description).with_priority(options.priority);
        task.required_capabilities = options.required_capabilities.clone();

        let ranked = orchestration::rank_eligible(
            self.queen.workers().await,
            &self.consensus,
            &task.required_capabilities,
        )
        .await;
        if ranked.is_empty() {
            warn!(task_id = %task.id, "No eligible worker for task");
            return Err(HiveError::NoEligibleWorkers(task.id));
        }

        let result = orchestration::dispatch(
            task,
            &ranked,
            options.required_workers,
            options.strategy,
            self.config.orchestration.adaptive_escalation_timeout(),
        )
        .await?;

        for report in &result.reports {
            self.queen.record_completion(report).await;
        }
        Ok(result)
    }

    /// Pull validated patterns into every online worker, run an
    /// out-of-schedule aggregation pass and recompute the collective
    /// intelligence score.
    pub async fn trigger_collective_learning(&self) -> Result<f64> {
        if self.lifecycle.is_shutting_down() {
            return Err(HiveError::ShuttingDown);
        }

        let mut adopted = 0;
        for worker in self.queen.workers().await {
            if !worker.status().await.can_vote() {
                continue;
            }
            match worker.learn_from_collective().await {
                Ok(n) => adopted += n,
                Err(e) => warn!(worker_id = %worker.id(), error = %e, "Collective learning failed"),
            }
        }

        let report = self.aggregator.run_cycle().await?;
        let score = self.refresh_intelligence().await;

        info!(
            adopted,
            validated = report.validated.len(),
            collective_intelligence = score,
            "Collective learning triggered"
        );
        Ok(score)
    }

    async fn refresh_intelligence(&self) -> f64 {
        let metrics = self.aggregator.get_metrics().await;
        let workers = self.queen.workers().await;
        let mut performance = 0.0;
        for worker in &workers {
            performance += worker.performance_score().await;
        }
        let average_performance = if workers.is_empty() {
            0.0
        } else {
            performance / workers.len() as f64
        };

        let score = collective_intelligence_score(
            &self.config.collective_intelligence,
            metrics.growth_rate,
            average_performance,
            self.consensus.average_reputation().await,
        );
        *self.intelligence.write().await = score;
        score
    }

    pub async fn get_status(&self) -> HiveStatus {
        let workers = self.queen.workers().await;
        let mut active_worker_count = 0;
        for worker in &workers {
            if worker.status().await.can_vote() {
                active_worker_count += 1;
            }
        }

        HiveStatus {
            queen_active: self.queen.is_active().await,
            worker_count: workers.len(),
            active_worker_count,
            patterns_aggregated: self.aggregator.get_metrics().await.validated_patterns,
            consensus_node_count: self.consensus.node_count().await,
            collective_intelligence_score: *self.intelligence.read().await,
        }
    }

    pub async fn aggregator_metrics(&self) -> AggregatorMetrics {
        self.aggregator.get_metrics().await
    }

    pub async fn consensus_metrics(&self) -> ConsensusMetrics {
        self.consensus.get_metrics().await
    }

    /// Stop the queen's loops, drain in-flight proposals and aggregation
    /// passes within the grace period, then stop the aggregation loop.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down hive mind");
        self.queen.abdicate(None).await?;

        let drained = self.lifecycle.shutdown(self.config.shutdown_grace()).await;
        if let Some(handle) = self.aggregation_loop.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Aggregation loop ended abnormally");
            }
        }

        info!(drained, "Hive mind shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::WorkerRole;
    use crate::test_utils::ScriptedExecutor;
    use hivemind_store::MemoryStore;

    fn collaborators() -> Collaborators {
        Collaborators::new(Arc::new(ScriptedExecutor::succeeding()))
    }

    #[test]
    fn test_collective_intelligence_score() {
        let weights = CollectiveIntelligenceWeights::default();
        assert_eq!(collective_intelligence_score(&weights, 0.0, 0.0, 0.0), 0.0);

        let score = collective_intelligence_score(&weights, 1.0, 0.5, 0.5);
        assert!((score - (0.3 * 0.5 + 0.4 * 0.5 + 0.3 * 0.5)).abs() < 1e-9);

        let saturated = collective_intelligence_score(&weights, 1e9, 1.0, 1.0);
        assert!(saturated <= 1.0 && saturated > 0.99);
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let config = HiveConfig {
            max_workers: 0,
            ..HiveConfig::default()
        };
        let result = HiveMind::initialize(Arc::new(MemoryStore::new()), config, collaborators()).await;
        assert!(matches!(result, Err(HiveError::Config(_))));
    }

    #[tokio::test]
    async fn test_unavailable_store_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let result = HiveMind::initialize(store, HiveConfig::default(), collaborators()).await;
        assert!(matches!(result, Err(HiveError::Store(_))));
    }

    #[tokio::test]
    async fn test_status_and_shutdown() {
        let hive = HiveMind::initialize(Arc::new(MemoryStore::new()), HiveConfig::default(), collaborators())
            .await
            .unwrap();
        hive.spawn_worker(WorkerSpec::new("w-1", WorkerRole::Architect))
            .await
            .unwrap();
        hive.spawn_worker(WorkerSpec::new("w-2", WorkerRole::Tester))
            .await
            .unwrap();

        let status = hive.get_status().await;
        assert!(status.queen_active);
        assert_eq!(status.worker_count, 2);
        assert_eq!(status.active_worker_count, 2);
        assert_eq!(status.consensus_node_count, 3);
        assert_eq!(status.patterns_aggregated, 0);

        let score = hive.trigger_collective_learning().await.unwrap();
        assert!(score > 0.0);
        assert_eq!(hive.get_status().await.collective_intelligence_score, score);

        hive.shutdown().await.unwrap();
        assert!(!hive.get_status().await.queen_active);
        assert!(matches!(
            hive.spawn_worker(WorkerSpec::new("w-3", WorkerRole::Tester)).await,
            Err(HiveError::ShuttingDown)
        ));
        assert!(matches!(
            hive.orchestrate_task("anything", OrchestrationOptions::default()).await,
            Err(HiveError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_orchestrate_without_matching_workers() {
        let hive = HiveMind::initialize(Arc::new(MemoryStore::new()), HiveConfig::default(), collaborators())
            .await
            .unwrap();
        hive.spawn_worker(WorkerSpec::new("w-1", WorkerRole::Researcher))
            .await
            .unwrap();

        let options = OrchestrationOptions::default().with_capability("coding");
        assert!(matches!(
            hive.orchestrate_task("write code", options).await,
            Err(HiveError::NoEligibleWorkers(_))
        ));
        hive.shutdown().await.unwrap();
    }
}
