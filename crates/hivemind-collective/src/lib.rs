//! Queen-led collective intelligence for worker agents.
//!
//! A single queen coordinates a pool of role-specialised workers. Workers
//! execute tasks through an external executor, learn patterns from what
//! worked and contribute them to the collective. The pattern aggregator
//! groups contributions by structural signature, resolves conflicts and
//! submits candidates to a Byzantine fault-tolerant consensus engine;
//! approved candidates join the collective library that every worker can
//! learn from.
//!
//! - **Consensus**: reputation-weighted, multi-round voting with fault
//!   detection and quarantine
//! - **Aggregation**: merge, defer-to-expert, variant and vote strategies
//! - **Queen**: directives, proportional allocation, periodic health checks
//! - **Orchestration**: parallel, sequential and adaptive task dispatch
//!
//! # Usage
//!
//! ```ignore
//! use hivemind_collective::{Collaborators, HiveMind, OrchestrationOptions, WorkerRole, WorkerSpec};
//!
//! let hive = HiveMind::initialize(store, config, Collaborators::new(executor)).await?;
//! hive.spawn_worker(WorkerSpec::new("w-1", WorkerRole::Implementer)).await?;
//! let result = hive.orchestrate_task("fix the flaky test", OrchestrationOptions::default()).await?;
//! hive.shutdown().await?;
//! ```

pub mod aggregation;
pub mod capability;
pub mod collaborators;
pub mod consensus;
pub mod events;
pub mod fault;
pub mod hive;
pub mod lifecycle;
pub mod node;
pub mod orchestration;
pub mod pattern;
pub mod queen;
pub mod task;
pub mod types;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export main types for convenience
pub use aggregation::{AggregationReport, AggregatorMetrics, PatternAggregator};
pub use capability::{TaskOutcome, WorkerRole, WorkerSpec, WorkerStatus};
pub use collaborators::{
    BestPattern, LearningPipeline, NoopLearningPipeline, NoopPatternExtractor, OutcomeRecord,
    PatternExtractor, TaskExecutor,
};
pub use consensus::{
    Ballot, BallotRequest, ConsensusEngine, ConsensusMetrics, Proposal, ProposalOutcome,
    ProposalStatus, ProposalType, Vote, Voter,
};
pub use events::{EventBus, EventReceiver, HiveEvent};
pub use fault::{FaultKind, FaultRecord};
pub use hive::{Collaborators, HiveMind, HiveStatus};
pub use lifecycle::Lifecycle;
pub use node::ConsensusNode;
pub use orchestration::{
    OrchestrationOptions, OrchestrationResult, OrchestrationStatus, OrchestrationStrategy,
};
pub use pattern::{PatternAction, PatternContribution, PatternDraft, ResolutionStrategy, ValidatedPattern};
pub use queen::{Allocation, HiveHealth, QueenCoordinator, ResourceRequest, SovereigntyStatus, TaskDemand, ThreatLevel};
pub use task::{Observation, Task, TaskPriority, TaskReport};
pub use types::{HiveError, NodeId, ProposalId, Result, Signature, TaskId, WorkerId};
pub use worker::{Directive, WorkerAgent, WorkerState};
