//! Queen-led worker hive with Byzantine fault-tolerant pattern consensus.

pub mod telemetry;

pub use hivemind_collective::{
    aggregation, capability, collaborators, consensus, events, fault, hive, lifecycle, node,
    orchestration, pattern, queen, task, types, worker,
};
pub use hivemind_collective::{
    Collaborators, Directive, HiveError, HiveEvent, HiveMind, HiveStatus, OrchestrationOptions,
    OrchestrationResult, OrchestrationStrategy, Result, TaskExecutor, TaskOutcome, TaskPriority,
    WorkerRole, WorkerSpec,
};
pub use hivemind_config::{config, ConfigError, HiveConfig};
pub use hivemind_store::{HiveStore, MemoryStore, Namespace, StoreError};

use std::sync::Arc;

/// Bring up a hive over `store`.
///
/// Fails if `config` does not validate or the store is unreachable.
pub async fn initialize_hive_mind(
    store: Arc<dyn HiveStore>,
    config: HiveConfig,
    collaborators: Collaborators,
) -> Result<Arc<HiveMind>> {
    HiveMind::initialize(store, config, collaborators).await
}
