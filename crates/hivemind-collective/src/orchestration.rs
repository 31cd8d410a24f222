//! Task dispatch across the worker pool.

use crate::consensus::ConsensusEngine;
use crate::task::{Task, TaskPriority, TaskReport};
use crate::types::{HiveError, Result, TaskId, WorkerId};
use crate::worker::WorkerAgent;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStrategy {
    /// Everyone at once; a strict majority must succeed
    Parallel,
    /// One at a time in rank order until one succeeds
    Sequential,
    /// Parallel first, sequential over the rest if nothing succeeds in time
    #[default]
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationOptions {
    pub kind: String,
    pub priority: TaskPriority,
    pub required_workers: usize,
    pub strategy: OrchestrationStrategy,
    pub required_capabilities: BTreeSet<String>,
}

impl Default for OrchestrationOptions {
    fn default() -> Self {
        Self {
            kind: "general".to_string(),
            priority: TaskPriority::Normal,
            required_workers: 3,
            strategy: OrchestrationStrategy::default(),
            required_capabilities: BTreeSet::new(),
        }
    }
}

impl OrchestrationOptions {
    pub fn with_strategy(mut self, strategy: OrchestrationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_required_workers(mut self, count: usize) -> Self {
        self.required_workers = count;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub task_id: TaskId,
    pub strategy: OrchestrationStrategy,
    pub status: OrchestrationStatus,

    /// Workers the task was sent to, in dispatch order
    pub dispatched: Vec<WorkerId>,

    pub reports: Vec<TaskReport>,

    /// Workers that could not run the task at all
    pub errors: Vec<(WorkerId, String)>,

    /// Adaptive dispatch fell back to sequential
    pub escalated: bool,
}

impl OrchestrationResult {
    pub fn is_success(&self) -> bool {
        self.status == OrchestrationStatus::Succeeded
    }

    pub fn successes(&self) -> usize {
        self.reports.iter().filter(|r| r.is_success()).count()
    }
}

/// Available, non-quarantined workers holding every required capability,
/// best performers first.
pub async fn rank_eligible(
    workers: Vec<Arc<WorkerAgent>>,
    consensus: &ConsensusEngine,
    required: &BTreeSet<String>,
) -> Vec<Arc<WorkerAgent>> {
    let mut ranked = Vec::with_capacity(workers.len());
    for worker in workers {
        if !worker.status().await.is_available()
            || !worker.has_capabilities(required)
            || consensus.is_quarantined(worker.id()).await
        {
            continue;
        }
        ranked.push((worker.performance_score().await, worker));
    }
    ranked.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id().cmp(b.1.id()))
    });
    ranked.into_iter().map(|(_, worker)| worker).collect()
}

type Execution = JoinHandle<(WorkerId, Result<TaskReport>)>;

fn spawn_execution(worker: &Arc<WorkerAgent>, task: &Task) -> Execution {
    let worker = Arc::clone(worker);
    let task = task.clone();
    tokio::spawn(async move {
        let result = worker.execute_task(task).await;
        (worker.id().clone(), result)
    })
}

#[derive(Debug, Default)]
struct Tally {
    dispatched: Vec<WorkerId>,
    reports: Vec<TaskReport>,
    errors: Vec<(WorkerId, String)>,
}

impl Tally {
    /// Returns whether the execution succeeded.
    fn record(&mut self, worker_id: WorkerId, result: Result<TaskReport>) -> bool {
        match result {
            Ok(report) => {
                let success = report.is_success();
                self.reports.push(report);
                success
            }
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Worker could not run task");
                self.errors.push((worker_id, e.to_string()));
                false
            }
        }
    }

    fn record_joined(
        &mut self,
        joined: std::result::Result<(WorkerId, Result<TaskReport>), tokio::task::JoinError>,
    ) -> bool {
        match joined {
            Ok((worker_id, result)) => self.record(worker_id, result),
            Err(e) => {
                warn!(error = %e, "Task execution panicked or was cancelled");
                false
            }
        }
    }

    fn successes(&self) -> usize {
        self.reports.iter().filter(|r| r.is_success()).count()
    }
}

/// Run `task` on `ranked` according to `strategy`. `limit` caps the
/// parallel selection; adaptive escalation draws from the rest of `ranked`.
pub async fn dispatch(
    task: Task,
    ranked: &[Arc<WorkerAgent>],
    limit: usize,
    strategy: OrchestrationStrategy,
    escalation_timeout: Duration,
) -> Result<OrchestrationResult> {
    let limit = limit.max(1).min(ranked.len());
    if limit == 0 {
        return Err(HiveError::NoEligibleWorkers(task.id.clone()));
    }
    let (selected, reserve) = ranked.split_at(limit);

    info!(
        task_id = %task.id,
        strategy = ?strategy,
        workers = selected.len(),
        "Dispatching task"
    );

    let mut tally = Tally::default();
    let mut escalated = false;
    let succeeded = match strategy {
        OrchestrationStrategy::Parallel => {
            tally.dispatched = selected.iter().map(|w| w.id().clone()).collect();
            let handles: Vec<Execution> = selected.iter().map(|w| spawn_execution(w, &task)).collect();
            for joined in futures::future::join_all(handles).await {
                tally.record_joined(joined);
            }
            tally.successes() * 2 > tally.dispatched.len()
        }
        OrchestrationStrategy::Sequential => run_sequential(&task, selected, &mut tally).await,
        OrchestrationStrategy::Adaptive => {
            tally.dispatched = selected.iter().map(|w| w.id().clone()).collect();
            let mut pending: FuturesUnordered<Execution> =
                selected.iter().map(|w| spawn_execution(w, &task)).collect();

            let deadline = Instant::now() + escalation_timeout;
            let mut succeeded = false;
            while !succeeded {
                match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(Some(joined)) => succeeded = tally.record_joined(joined),
                    Ok(None) | Err(_) => break,
                }
            }

            if !succeeded && !reserve.is_empty() {
                escalated = true;
                info!(
                    task_id = %task.id,
                    reserve = reserve.len(),
                    "No parallel success in time, escalating to sequential"
                );
                succeeded = run_sequential(&task, reserve, &mut tally).await;
            }

            // In-flight parallel runs are never dropped mid-task
            while let Some(joined) = pending.next().await {
                succeeded |= tally.record_joined(joined);
            }
            succeeded
        }
    };

    let status = if succeeded {
        OrchestrationStatus::Succeeded
    } else {
        OrchestrationStatus::Failed
    };
    info!(
        task_id = %task.id,
        status = ?status,
        successes = tally.successes(),
        dispatched = tally.dispatched.len(),
        escalated,
        "Task orchestrated"
    );

    Ok(OrchestrationResult {
        task_id: task.id,
        strategy,
        status,
        dispatched: tally.dispatched,
        reports: tally.reports,
        errors: tally.errors,
        escalated,
    })
}

async fn run_sequential(task: &Task, workers: &[Arc<WorkerAgent>], tally: &mut Tally) -> bool {
    for worker in workers {
        tally.dispatched.push(worker.id().clone());
        let result = worker.execute_task(task.clone()).await;
        if tally.record(worker.id().clone(), result) {
            return true;
        }
        debug!(task_id = %task.id, worker_id = %worker.id(), "Trying next worker");
    }
    false
}
