use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "HIVEMIND_CONFIG";

/// Environment variable overriding `max_workers`.
pub const MAX_WORKERS_ENV_VAR: &str = "HIVEMIND_MAX_WORKERS";

/// Hard upper bound on the worker pool.
pub const MAX_WORKERS_LIMIT: usize = 100;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level hive configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HiveConfig {
    /// Maximum number of registered workers (at most 100)
    pub max_workers: usize,

    /// Grace period for in-flight rounds and passes during shutdown
    pub shutdown_grace_ms: u64,

    pub consensus: ConsensusConfig,
    pub queen: QueenConfig,
    pub aggregation: AggregationConfig,
    pub orchestration: OrchestrationConfig,
    pub collective_intelligence: CollectiveIntelligenceWeights,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            shutdown_grace_ms: 5_000,
            consensus: ConsensusConfig::default(),
            queen: QueenConfig::default(),
            aggregation: AggregationConfig::default(),
            orchestration: OrchestrationConfig::default(),
            collective_intelligence: CollectiveIntelligenceWeights::default(),
        }
    }
}

/// Weighted multi-round voting parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Fraction of eligible nodes that must vote for a round to count
    pub quorum_threshold: f64,
    /// Weighted affirmative fraction required for approval
    pub consensus_threshold: f64,
    pub round_timeout_ms: u64,
    pub max_rounds: u32,
    /// Reputation below which a node is quarantined
    pub quarantine_threshold: f64,
    /// Smallest eligible set a proposal may start with
    pub min_nodes: usize,
    pub default_reputation: f64,
    /// Reward for voting with the final decision
    pub reputation_gain: f64,
    /// Penalty for a detected fault
    pub reputation_penalty: f64,
    /// Number of recent proposals remembered per node
    pub fault_history_window: usize,
    /// Flags within the window that trigger persistent suspicion
    pub persistent_fault_limit: usize,
    pub low_reputation_threshold: f64,
    /// Definitive max-confidence votes tolerated from a low-reputation node
    pub mismatch_limit: u32,
    /// Allowed distance from the round median for confident votes
    pub outlier_deviation: f64,
    /// Justification confidence below which a definitive vote is inconsistent
    pub inconsistent_confidence: f64,
    /// Justification confidence above which an outlier is suspicious
    pub outlier_confidence: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum_threshold: 0.6,
            consensus_threshold: 0.67,
            round_timeout_ms: 30_000,
            max_rounds: 3,
            quarantine_threshold: 0.2,
            min_nodes: 3,
            default_reputation: 0.5,
            reputation_gain: 0.05,
            reputation_penalty: 0.3,
            fault_history_window: 10,
            persistent_fault_limit: 3,
            low_reputation_threshold: 0.4,
            mismatch_limit: 2,
            outlier_deviation: 0.4,
            inconsistent_confidence: 0.3,
            outlier_confidence: 0.7,
        }
    }
}

impl ConsensusConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

/// Queen periodic loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueenConfig {
    pub health_check_interval_ms: u64,
    pub status_report_interval_ms: u64,
    /// Window used for threat level and throughput; defaults to the health interval
    pub threat_window_ms: Option<u64>,
}

impl Default for QueenConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 60_000,
            status_report_interval_ms: 120_000,
            threat_window_ms: None,
        }
    }
}

impl QueenConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn status_report_interval(&self) -> Duration {
        Duration::from_millis(self.status_report_interval_ms)
    }

    pub fn threat_window(&self) -> Duration {
        Duration::from_millis(
            self.threat_window_ms
                .unwrap_or(self.health_check_interval_ms),
        )
    }
}

/// Pattern aggregation cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregationConfig {
    pub interval_ms: u64,
    pub min_contributors: usize,
    /// Above this variance a group is treated as conflicting
    pub conflict_variance_threshold: f64,
    /// Reputation lead needed for defer-to-expert
    pub expert_margin: f64,
    /// Lifetime of raw contributions in the store
    pub contribution_ttl_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
            min_contributors: 2,
            conflict_variance_threshold: 0.15,
            expert_margin: 0.3,
            contribution_ttl_secs: 86_400,
        }
    }
}

impl AggregationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn contribution_ttl(&self) -> Duration {
        Duration::from_secs(self.contribution_ttl_secs)
    }
}

/// Task dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// How long adaptive dispatch waits for a parallel success
    pub adaptive_escalation_timeout_ms: u64,
    /// Upper bound on a single worker's task execution
    pub task_timeout_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            adaptive_escalation_timeout_ms: 10_000,
            task_timeout_ms: 120_000,
        }
    }
}

impl OrchestrationConfig {
    pub fn adaptive_escalation_timeout(&self) -> Duration {
        Duration::from_millis(self.adaptive_escalation_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

/// Blend used for the collective intelligence score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectiveIntelligenceWeights {
    pub growth: f64,
    pub performance: f64,
    pub reputation: f64,
}

impl Default for CollectiveIntelligenceWeights {
    fn default() -> Self {
        Self {
            growth: 0.3,
            performance: 0.4,
            reputation: 0.3,
        }
    }
}

impl HiveConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;

        info!(path = %path.display(), "Loaded hive configuration");
        Ok(config)
    }

    /// Load from `$HIVEMIND_CONFIG`, then the platform config directory,
    /// falling back to defaults when neither file exists.
    pub fn load_default() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load(path);
        }

        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(path);
            }
        }

        debug!("No config file found, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/hivemind/config.toml` for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("ai", "hivemind", "hivemind")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(MAX_WORKERS_ENV_VAR) {
            self.max_workers = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "max_workers",
                reason: format!("{} is not a number: {:?}", MAX_WORKERS_ENV_VAR, raw),
            })?;
        }
        Ok(())
    }

    /// Check every option is within its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 || self.max_workers > MAX_WORKERS_LIMIT {
            return Err(invalid(
                "max_workers",
                format!("must be between 1 and {}", MAX_WORKERS_LIMIT),
            ));
        }

        let c = &self.consensus;
        unit_interval("consensus.quorum_threshold", c.quorum_threshold)?;
        unit_interval("consensus.consensus_threshold", c.consensus_threshold)?;
        unit_interval("consensus.quarantine_threshold", c.quarantine_threshold)?;
        unit_interval("consensus.default_reputation", c.default_reputation)?;
        unit_interval("consensus.reputation_gain", c.reputation_gain)?;
        unit_interval("consensus.reputation_penalty", c.reputation_penalty)?;
        unit_interval("consensus.low_reputation_threshold", c.low_reputation_threshold)?;
        unit_interval("consensus.outlier_deviation", c.outlier_deviation)?;
        unit_interval("consensus.inconsistent_confidence", c.inconsistent_confidence)?;
        unit_interval("consensus.outlier_confidence", c.outlier_confidence)?;
        if c.max_rounds == 0 {
            return Err(invalid("consensus.max_rounds", "must be at least 1"));
        }
        if c.round_timeout_ms == 0 {
            return Err(invalid("consensus.round_timeout_ms", "must be positive"));
        }
        if c.min_nodes == 0 {
            return Err(invalid("consensus.min_nodes", "must be at least 1"));
        }
        if c.fault_history_window == 0 || c.persistent_fault_limit == 0 {
            return Err(invalid(
                "consensus.fault_history_window",
                "window and persistent_fault_limit must be positive",
            ));
        }

        let q = &self.queen;
        if q.health_check_interval_ms == 0 || q.status_report_interval_ms == 0 {
            return Err(invalid("queen", "loop intervals must be positive"));
        }

        let a = &self.aggregation;
        if a.interval_ms == 0 {
            return Err(invalid("aggregation.interval_ms", "must be positive"));
        }
        if a.min_contributors < 2 {
            return Err(invalid(
                "aggregation.min_contributors",
                "a validated pattern needs at least 2 contributors",
            ));
        }
        unit_interval(
            "aggregation.conflict_variance_threshold",
            a.conflict_variance_threshold,
        )?;
        unit_interval("aggregation.expert_margin", a.expert_margin)?;

        if self.orchestration.task_timeout_ms == 0 {
            return Err(invalid("orchestration.task_timeout_ms", "must be positive"));
        }

        let w = &self.collective_intelligence;
        for (field, value) in [
            ("collective_intelligence.growth", w.growth),
            ("collective_intelligence.performance", w.performance),
            ("collective_intelligence.reputation", w.reputation),
        ] {
            if value < 0.0 {
                return Err(invalid(field, "weights cannot be negative"));
            }
        }
        if w.growth + w.performance + w.reputation <= 0.0 {
            return Err(invalid("collective_intelligence", "weights sum to zero"));
        }

        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(invalid(field, format!("{} is outside [0, 1]", value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = HiveConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.consensus.quorum_threshold, 0.6);
        assert_eq!(config.consensus.consensus_threshold, 0.67);
        assert_eq!(config.consensus.max_rounds, 3);
        assert_eq!(config.aggregation.min_contributors, 2);
        assert_eq!(config.queen.threat_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = HiveConfig::from_toml_str(
            r#"
            max_workers = 12

            [consensus]
            round_timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.max_workers, 12);
        assert_eq!(config.consensus.round_timeout(), Duration::from_millis(500));
        assert_eq!(config.consensus.quorum_threshold, 0.6);
        assert_eq!(config.aggregation.interval_ms, 300_000);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut config = HiveConfig::default();
        config.max_workers = 101;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "max_workers", .. })
        ));

        let mut config = HiveConfig::default();
        config.consensus.quorum_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = HiveConfig::default();
        config.aggregation.min_contributors = 1;
        assert!(config.validate().is_err());

        let mut config = HiveConfig::default();
        config.consensus.max_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_workers = 4\n[aggregation]\nexpert_margin = 0.25").unwrap();

        std::env::set_var(MAX_WORKERS_ENV_VAR, "16");
        let config = HiveConfig::load(file.path()).unwrap();
        std::env::remove_var(MAX_WORKERS_ENV_VAR);

        assert_eq!(config.max_workers, 16);
        assert_eq!(config.aggregation.expert_margin, 0.25);
    }

    #[test]
    #[serial]
    fn test_load_default_honours_env_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(&path, "max_workers = 3\n").unwrap();

        std::env::set_var(CONFIG_ENV_VAR, &path);
        let config = HiveConfig::load_default().unwrap();
        std::env::remove_var(CONFIG_ENV_VAR);

        assert_eq!(config.max_workers, 3);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = HiveConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
