//! Common types used across the hive.

use hivemind_config::ConfigError;
use hivemind_store::StoreError;

/// Identifier of a consensus node (one per worker, plus the queen).
pub type NodeId = String;

/// Identifier of a worker agent.
pub type WorkerId = String;

/// Unique identifier for a proposal.
pub type ProposalId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Hex-encoded structural hash of a pattern.
pub type Signature = String;

/// Error types for hive operations.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    #[error("Node already registered: {0}")]
    DuplicateNode(NodeId),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Insufficient eligible nodes: required {required}, got {actual}")]
    InsufficientNodes { required: usize, actual: usize },

    #[error("Quorum not met: required {required}, got {actual}")]
    QuorumNotMet { required: f64, actual: f64 },

    #[error("Consensus timed out for proposal {0}")]
    ConsensusTimeout(ProposalId),

    #[error("Node is quarantined: {0}")]
    QuarantinedNode(NodeId),

    #[error("Conflict unresolved for signature {signature}: {reason}")]
    ConflictUnresolved { signature: Signature, reason: String },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid worker spec: {0}")]
    InvalidWorkerSpec(String),

    #[error("Worker capacity exceeded: limit {limit}")]
    CapacityExceeded { limit: usize },

    #[error("No eligible worker for task: {0}")]
    NoEligibleWorkers(String),

    #[error("Hive is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HiveError>;

/// Clamp a score into `[0, 1]`, mapping NaN to 0.
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
