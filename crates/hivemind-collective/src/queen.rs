//! The queen: single authority over the worker pool.
//!
//! Owns the subject registry, issues directives, allocates workers to
//! demands and runs the periodic health-check and status-report loops. The
//! queen is itself a consensus node and votes while sovereign.

use crate::capability::{WorkerSpec, WorkerStatus};
use crate::consensus::{Ballot, BallotRequest, ConsensusEngine, ProposalType, Voter, WeakVoter};
use crate::events::{EventBus, HiveEvent};
use crate::lifecycle::Lifecycle;
use crate::pattern::PatternCandidate;
use crate::task::{TaskPriority, TaskReport};
use crate::types::{HiveError, NodeId, Result, TaskId, WorkerId};
use crate::worker::{Directive, WorkerAgent, WorkerContext, WorkerState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hivemind_config::HiveConfig;
use hivemind_store::{HiveStore, Namespace, StoreExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Consensus node id the queen votes under.
pub const QUEEN_NODE_ID: &str = "queen";

const QUEEN_VOTE_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SovereigntyStatus {
    #[default]
    Dormant,
    SovereignActive,
    Abdicated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl ThreatLevel {
    /// Classify the number of Byzantine faults seen in the threat window.
    pub fn from_fault_count(faults: usize) -> Self {
        match faults {
            0 => Self::Low,
            1..=2 => Self::Medium,
            _ => Self::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HiveHealth {
    /// Fraction of workers that reported within the last health interval
    pub coherence_score: f64,

    /// Mean outcome score of tasks finished within the last window
    pub swarm_efficiency: f64,

    pub threat_level: ThreatLevel,
    pub checked_at: DateTime<Utc>,
}

impl Default for HiveHealth {
    fn default() -> Self {
        Self {
            coherence_score: 0.0,
            swarm_efficiency: 0.0,
            threat_level: ThreatLevel::Low,
            checked_at: Utc::now(),
        }
    }
}

/// One target's response to a directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceRecord {
    pub directive: Directive,
    pub worker_id: WorkerId,
    pub complied: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

/// Per-target results of [`QueenCoordinator::issue_directive`].
#[derive(Debug, Clone, Default)]
pub struct DirectiveReport {
    pub complied: Vec<WorkerId>,
    pub failed: Vec<(WorkerId, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDemand {
    pub task_id: TaskId,
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub demands: Vec<TaskDemand>,

    /// Upper bound on workers handed out
    pub max_agents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub worker_id: WorkerId,
    pub task_id: TaskId,

    /// Fraction of the allocated capacity, summing to 1 across a plan
    pub share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: SovereigntyStatus,
    pub subjects: usize,
    pub active_workers: usize,
    pub health: HiveHealth,
    pub allocations: BTreeMap<WorkerId, f64>,
    pub consensus_nodes: usize,
    pub average_reputation: f64,
    pub successor: Option<WorkerId>,
    pub generated_at: DateTime<Utc>,
}

/// Split `workers` (best first) across `demands` in proportion to priority
/// weight, using largest remainders. Higher priorities receive the better
/// workers.
pub fn plan_allocation(workers: &[WorkerId], demands: &[TaskDemand]) -> Vec<Allocation> {
    if workers.is_empty() || demands.is_empty() {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..demands.len()).collect();
    order.sort_by(|a, b| demands[*b].priority.cmp(&demands[*a].priority));

    let total_weight: u32 = demands.iter().map(|d| d.priority.weight()).sum();
    let n = workers.len();

    let mut counts = vec![0usize; demands.len()];
    let mut remainders = Vec::with_capacity(demands.len());
    for &i in &order {
        let exact = n as f64 * demands[i].priority.weight() as f64 / total_weight as f64;
        counts[i] = exact.floor() as usize;
        remainders.push((i, exact - exact.floor()));
    }

    let mut leftover = n - counts.iter().sum::<usize>();
    remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (i, _) in remainders {
        if leftover == 0 {
            break;
        }
        counts[i] += 1;
        leftover -= 1;
    }

    let active_weight: u32 = order
        .iter()
        .filter(|&&i| counts[i] > 0)
        .map(|&i| demands[i].priority.weight())
        .sum();

    let mut ranked = workers.iter();
    let mut plan = Vec::with_capacity(n);
    for &i in &order {
        if counts[i] == 0 {
            continue;
        }
        let share = demands[i].priority.weight() as f64 / active_weight as f64 / counts[i] as f64;
        for worker_id in ranked.by_ref().take(counts[i]) {
            plan.push(Allocation {
                worker_id: worker_id.clone(),
                task_id: demands[i].task_id.clone(),
                share,
            });
        }
    }
    plan
}

fn window(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[derive(Debug, Clone, Copy)]
enum QueenLoop {
    HealthCheck,
    StatusReport,
}

pub struct QueenCoordinator {
    config: HiveConfig,
    consensus: Arc<ConsensusEngine>,
    worker_ctx: WorkerContext,
    store: Arc<dyn HiveStore>,
    events: EventBus,
    lifecycle: Lifecycle,
    status: RwLock<SovereigntyStatus>,
    workers: RwLock<BTreeMap<WorkerId, Arc<WorkerAgent>>>,
    health: RwLock<HiveHealth>,
    allocations: RwLock<BTreeMap<WorkerId, f64>>,
    compliance: RwLock<Vec<ComplianceRecord>>,
    completions: RwLock<VecDeque<(DateTime<Utc>, f64)>>,
    successor: RwLock<Option<WorkerId>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl QueenCoordinator {
    /// Create the queen and register it as a consensus node. `lifecycle`
    /// should be a child of the hive's so abdication stops only the queen.
    pub async fn new(
        config: HiveConfig,
        consensus: Arc<ConsensusEngine>,
        worker_ctx: WorkerContext,
        lifecycle: Lifecycle,
    ) -> Result<Arc<Self>> {
        let queen = Arc::new(Self {
            store: Arc::clone(&worker_ctx.store),
            events: worker_ctx.events.clone(),
            config,
            consensus,
            worker_ctx,
            lifecycle,
            status: RwLock::new(SovereigntyStatus::Dormant),
            workers: RwLock::new(BTreeMap::new()),
            health: RwLock::new(HiveHealth::default()),
            allocations: RwLock::new(BTreeMap::new()),
            compliance: RwLock::new(Vec::new()),
            completions: RwLock::new(VecDeque::new()),
            successor: RwLock::new(None),
            loops: Mutex::new(Vec::new()),
        });

        queen
            .consensus
            .register_node(QUEEN_NODE_ID, Arc::new(WeakVoter::new(&queen)))
            .await?;
        Ok(queen)
    }

    pub async fn status(&self) -> SovereigntyStatus {
        *self.status.read().await
    }

    pub async fn is_active(&self) -> bool {
        self.status().await == SovereigntyStatus::SovereignActive
    }

    /// Become the active authority and start the periodic loops. Calling it
    /// again while active does nothing.
    pub async fn establish_sovereignty(self: &Arc<Self>) -> Result<()> {
        {
            let mut status = self.status.write().await;
            match *status {
                SovereigntyStatus::SovereignActive => return Ok(()),
                SovereigntyStatus::Abdicated => return Err(HiveError::ShuttingDown),
                SovereigntyStatus::Dormant => *status = SovereigntyStatus::SovereignActive,
            }
        }

        let health_every = self.config.queen.health_check_interval();
        let report_every = self.config.queen.status_report_interval();
        let mut loops = self.loops.lock().await;
        loops.push(self.spawn_loop(QueenLoop::HealthCheck, health_every));
        loops.push(self.spawn_loop(QueenLoop::StatusReport, report_every));

        info!(
            health_interval_ms = health_every.as_millis() as u64,
            report_interval_ms = report_every.as_millis() as u64,
            "Sovereignty established"
        );
        self.events
            .publish(HiveEvent::SovereigntyEstablished { at: Utc::now() });
        Ok(())
    }

    fn spawn_loop(self: &Arc<Self>, kind: QueenLoop, period: Duration) -> JoinHandle<()> {
        let queen = Arc::downgrade(self);
        let token = self.lifecycle.token().clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let Some(queen) = Weak::upgrade(&queen) else { break };
                        match kind {
                            QueenLoop::HealthCheck => {
                                queen.lifecycle.track(queen.health_check()).await;
                            }
                            QueenLoop::StatusReport => {
                                queen.lifecycle.track(queen.status_report()).await;
                            }
                        }
                    }
                    _ = token.cancelled() => {
                        debug!(loop_kind = ?kind, "Queen loop stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Initialize a worker from `spec` and take it as a subject.
    pub async fn register_worker(&self, spec: WorkerSpec) -> Result<Arc<WorkerAgent>> {
        if self.lifecycle.is_shutting_down() || self.status().await == SovereigntyStatus::Abdicated {
            return Err(HiveError::ShuttingDown);
        }

        let mut workers = self.workers.write().await;
        if workers.contains_key(&spec.id) {
            return Err(HiveError::DuplicateWorker(spec.id));
        }
        if workers.len() >= self.config.max_workers {
            return Err(HiveError::CapacityExceeded {
                limit: self.config.max_workers,
            });
        }
        if self.consensus.node(&spec.id).await.is_some() {
            return Err(HiveError::DuplicateNode(spec.id));
        }

        let worker = WorkerAgent::initialize(spec, self.worker_ctx.clone()).await?;
        if let Err(e) = self
            .consensus
            .register_node(worker.id().clone(), Arc::new(WeakVoter::new(&worker)))
            .await
        {
            if let Err(cleanup) = self.store.delete(Namespace::HiveWorkers, worker.id()).await {
                warn!(worker_id = %worker.id(), error = %cleanup, "Failed to drop persisted worker state");
            }
            return Err(e);
        }
        workers.insert(worker.id().clone(), Arc::clone(&worker));
        drop(workers);

        info!(worker_id = %worker.id(), role = %worker.role(), "Worker registered");
        self.events.publish(HiveEvent::WorkerRegistered {
            worker_id: worker.id().clone(),
        });
        Ok(worker)
    }

    /// Release a subject. Its consensus node goes with it.
    pub async fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        let worker = self
            .workers
            .write()
            .await
            .remove(worker_id)
            .ok_or_else(|| HiveError::UnknownWorker(worker_id.to_string()))?;

        worker.set_status(WorkerStatus::Offline).await;
        if let Err(e) = self.consensus.deregister_node(worker_id).await {
            debug!(worker_id, error = %e, "Worker had no consensus node");
        }
        self.allocations.write().await.remove(worker_id);
        if let Err(e) = self.store.delete(Namespace::HiveWorkers, worker_id).await {
            warn!(worker_id, error = %e, "Failed to drop persisted worker state");
        }

        info!(worker_id, "Worker deregistered");
        self.events.publish(HiveEvent::WorkerDeregistered {
            worker_id: worker_id.to_string(),
        });
        Ok(())
    }

    pub async fn worker(&self, worker_id: &str) -> Option<Arc<WorkerAgent>> {
        self.workers.read().await.get(worker_id).cloned()
    }

    pub async fn workers(&self) -> Vec<Arc<WorkerAgent>> {
        self.workers.read().await.values().cloned().collect()
    }

    pub async fn subjects(&self) -> Vec<WorkerId> {
        self.workers.read().await.keys().cloned().collect()
    }

    pub async fn worker_states(&self) -> Vec<WorkerState> {
        let mut states = Vec::new();
        for worker in self.workers().await {
            states.push(worker.get_state().await);
        }
        states
    }

    /// Send `directive` to every target. Unknown targets fail individually
    /// without stopping the broadcast.
    pub async fn issue_directive(&self, directive: Directive, target_ids: &[WorkerId]) -> DirectiveReport {
        let mut report = DirectiveReport::default();
        let mut records = Vec::with_capacity(target_ids.len());

        for target in target_ids {
            let result = match self.worker(target).await {
                Some(worker) => worker.apply_directive(&directive).await,
                None => Err(HiveError::UnknownWorker(target.clone())),
            };

            let error = match result {
                Ok(()) => {
                    report.complied.push(target.clone());
                    None
                }
                Err(e) => {
                    warn!(worker_id = %target, directive = ?directive, error = %e, "Directive not applied");
                    report.failed.push((target.clone(), e.to_string()));
                    Some(e.to_string())
                }
            };
            records.push(ComplianceRecord {
                directive: directive.clone(),
                worker_id: target.clone(),
                complied: error.is_none(),
                error,
                recorded_at: Utc::now(),
            });
        }

        info!(
            directive = ?directive,
            complied = report.complied.len(),
            failed = report.failed.len(),
            "Directive issued"
        );

        let mut log = self.compliance.write().await;
        log.extend(records);
        if let Err(e) = self
            .store
            .put_record(Namespace::Coordination, "directive-compliance", &*log, None)
            .await
        {
            warn!(error = %e, "Failed to persist compliance log");
        }

        report
    }

    /// Allocate available, non-quarantined workers across the requested
    /// demands, best performers first, at most `max_agents` of them.
    pub async fn allocate_resources(&self, request: &ResourceRequest) -> Result<Vec<Allocation>> {
        if request.demands.is_empty() {
            return Ok(Vec::new());
        }

        let mut ranked = Vec::new();
        for worker in self.workers().await {
            if !worker.status().await.is_available()
                || self.consensus.is_quarantined(worker.id()).await
            {
                continue;
            }
            ranked.push((worker.performance_score().await, worker.id().clone()));
        }
        if ranked.is_empty() {
            return Err(HiveError::NoEligibleWorkers(
                "no active worker available for allocation".to_string(),
            ));
        }
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let selected: Vec<WorkerId> = ranked
            .into_iter()
            .take(request.max_agents)
            .map(|(_, id)| id)
            .collect();
        let plan = plan_allocation(&selected, &request.demands);

        {
            let mut table = self.allocations.write().await;
            table.clear();
            table.extend(plan.iter().map(|a| (a.worker_id.clone(), a.share)));
            if let Err(e) = self
                .store
                .put_record(Namespace::Coordination, "allocations", &*table, None)
                .await
            {
                warn!(error = %e, "Failed to persist allocation table");
            }
        }

        info!(
            demands = request.demands.len(),
            workers = plan.len(),
            "Resources allocated"
        );
        Ok(plan)
    }

    /// Feed a finished task into the efficiency window.
    pub async fn record_completion(&self, report: &TaskReport) {
        let cutoff = Utc::now() - window(self.config.queen.health_check_interval());
        let mut completions = self.completions.write().await;
        completions.push_back((Utc::now(), report.outcome.score()));
        while completions.front().is_some_and(|(at, _)| *at < cutoff) {
            completions.pop_front();
        }
    }

    /// Recompute hive health. Every worker that can still vote is pinged
    /// first; paused and offline workers keep their last heartbeat.
    pub async fn health_check(&self) -> HiveHealth {
        let workers = self.workers().await;
        for worker in &workers {
            if worker.status().await.can_vote() {
                worker.heartbeat().await;
            }
        }

        let now = Utc::now();
        let interval = window(self.config.queen.health_check_interval());
        let cutoff = now - interval;

        let mut reporting = 0usize;
        let mut performance = 0.0;
        for worker in &workers {
            if worker.last_heartbeat().await >= cutoff {
                reporting += 1;
            }
            performance += worker.performance_score().await;
        }
        let coherence_score = if workers.is_empty() {
            0.0
        } else {
            reporting as f64 / workers.len() as f64
        };

        let swarm_efficiency = {
            let mut completions = self.completions.write().await;
            while completions.front().is_some_and(|(at, _)| *at < cutoff) {
                completions.pop_front();
            }
            if !completions.is_empty() {
                completions.iter().map(|(_, score)| score).sum::<f64>() / completions.len() as f64
            } else if !workers.is_empty() {
                performance / workers.len() as f64
            } else {
                0.0
            }
        };

        let threat_since = now - window(self.config.queen.threat_window());
        let faults = self.consensus.faults_since(threat_since).await.len();
        let health = HiveHealth {
            coherence_score,
            swarm_efficiency,
            threat_level: ThreatLevel::from_fault_count(faults),
            checked_at: now,
        };

        *self.health.write().await = health.clone();
        if let Err(e) = self
            .store
            .put_record(Namespace::Coordination, "hive-health", &health, None)
            .await
        {
            warn!(error = %e, "Failed to persist hive health");
        }

        info!(
            coherence = health.coherence_score,
            efficiency = health.swarm_efficiency,
            threat = health.threat_level.as_str(),
            recent_faults = faults,
            "Health check completed"
        );
        self.events.publish(HiveEvent::HealthChecked {
            coherence_score: health.coherence_score,
            swarm_efficiency: health.swarm_efficiency,
            threat_level: health.threat_level.as_str().to_string(),
        });
        health
    }

    pub async fn hive_health(&self) -> HiveHealth {
        self.health.read().await.clone()
    }

    pub async fn allocation_table(&self) -> BTreeMap<WorkerId, f64> {
        self.allocations.read().await.clone()
    }

    pub async fn compliance_log(&self) -> Vec<ComplianceRecord> {
        self.compliance.read().await.clone()
    }

    pub async fn successor(&self) -> Option<WorkerId> {
        self.successor.read().await.clone()
    }

    /// Snapshot of the hive, also written to the coordination namespace.
    pub async fn status_report(&self) -> StatusReport {
        let mut active_workers = 0;
        let workers = self.workers().await;
        for worker in &workers {
            if worker.status().await.can_vote() {
                active_workers += 1;
            }
        }

        let report = StatusReport {
            status: self.status().await,
            subjects: workers.len(),
            active_workers,
            health: self.hive_health().await,
            allocations: self.allocation_table().await,
            consensus_nodes: self.consensus.node_count().await,
            average_reputation: self.consensus.average_reputation().await,
            successor: self.successor().await,
            generated_at: Utc::now(),
        };

        if let Err(e) = self
            .store
            .put_record(Namespace::Coordination, "status-report", &report, None)
            .await
        {
            warn!(error = %e, "Failed to persist status report");
        }
        debug!(
            subjects = report.subjects,
            active = report.active_workers,
            nodes = report.consensus_nodes,
            "Status report"
        );
        report
    }

    /// Stop the periodic loops, persist a final health snapshot and step
    /// down. In-flight health checks get the configured grace period.
    pub async fn abdicate(&self, successor: Option<WorkerId>) -> Result<()> {
        if self.status().await == SovereigntyStatus::Abdicated {
            return Ok(());
        }
        if let Some(id) = &successor {
            if self.worker(id).await.is_none() {
                return Err(HiveError::UnknownWorker(id.clone()));
            }
        }

        self.lifecycle.shutdown(self.config.shutdown_grace()).await;
        for handle in self.loops.lock().await.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Queen loop ended abnormally");
            }
        }

        let health = self.health_check().await;
        if let Err(e) = self
            .store
            .put_record(Namespace::Coordination, "final-health", &health, None)
            .await
        {
            warn!(error = %e, "Failed to persist final hive health");
        }

        *self.status.write().await = SovereigntyStatus::Abdicated;
        *self.successor.write().await = successor.clone();

        info!(successor = ?successor, "Queen abdicated");
        self.events.publish(HiveEvent::Abdicated {
            successor,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        QUEEN_NODE_ID.to_string()
    }
}

#[async_trait]
impl Voter for QueenCoordinator {
    async fn cast_vote(&self, request: &BallotRequest) -> Option<Ballot> {
        if !self.is_active().await {
            return None;
        }
        match &request.proposal_type {
            ProposalType::PatternValidation => {
                let candidate: PatternCandidate = serde_json::from_value(request.payload.clone()).ok()?;
                Some(Ballot::new(
                    candidate.draft.confidence,
                    QUEEN_VOTE_CONFIDENCE,
                    "queen endorses candidate confidence",
                ))
            }
            _ => Some(Ballot::new(1.0, QUEEN_VOTE_CONFIDENCE, "queen endorses")),
        }
    }
}
