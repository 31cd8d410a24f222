//! Configuration for the hivemind coordinator.
//!
//! Every option has a default, so an empty TOML document is a valid
//! configuration. Values are loaded in three layers:
//!
//! 1. built-in defaults
//! 2. a TOML file (`HiveConfig::load` / `HiveConfig::load_default`)
//! 3. environment overrides (`HIVEMIND_MAX_WORKERS`)
//!
//! `HiveConfig::validate` must pass before the hive starts; a validation
//! failure is fatal.

pub mod config;

pub use config::{
    AggregationConfig, CollectiveIntelligenceWeights, ConfigError, ConsensusConfig, HiveConfig,
    OrchestrationConfig, QueenConfig, Result, CONFIG_ENV_VAR, MAX_WORKERS_ENV_VAR,
    MAX_WORKERS_LIMIT,
};
