//! Worker roles, capabilities and task outcomes.

use crate::types::{HiveError, Result, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// The closed set of roles a worker can play.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Architect,
    Researcher,
    Implementer,
    Tester,
    Reviewer,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 5] = [
        WorkerRole::Architect,
        WorkerRole::Researcher,
        WorkerRole::Implementer,
        WorkerRole::Tester,
        WorkerRole::Reviewer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Researcher => "researcher",
            Self::Implementer => "implementer",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
        }
    }

    /// Capabilities every worker of this role starts with.
    pub fn default_capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::Architect => &["design", "planning", "decomposition"],
            Self::Researcher => &["research", "analysis", "summarization"],
            Self::Implementer => &["coding", "refactoring", "integration"],
            Self::Tester => &["testing", "validation", "coverage"],
            Self::Reviewer => &["review", "validation", "quality"],
        }
    }

    /// Autonomy assumed when a spec does not set one.
    pub fn default_autonomy(&self) -> f64 {
        match self {
            Self::Architect => 0.8,
            Self::Researcher => 0.7,
            Self::Implementer => 0.6,
            Self::Tester => 0.5,
            Self::Reviewer => 0.7,
        }
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "architect" => Ok(Self::Architect),
            "researcher" => Ok(Self::Researcher),
            "implementer" => Ok(Self::Implementer),
            "tester" => Ok(Self::Tester),
            "reviewer" => Ok(Self::Reviewer),
            other => Err(HiveError::InvalidWorkerSpec(format!("unknown role '{other}'"))),
        }
    }
}

/// Availability of a worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    #[default]
    Idle,
    Busy,
    Paused,
    Offline,
}

impl WorkerStatus {
    /// Active or idle workers can be selected for tasks and allocations.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }

    /// Paused and offline workers abstain from consensus.
    pub fn can_vote(&self) -> bool {
        !matches!(self, Self::Paused | Self::Offline)
    }
}

/// Everything needed to bring a worker up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub role: WorkerRole,

    /// Extra capabilities on top of the role defaults
    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    #[serde(default)]
    pub specializations: Vec<String>,

    /// Step size of the performance moving average, in `(0, 0.3]`
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// In `[0, 1]`; the role default when absent
    #[serde(default)]
    pub autonomy: Option<f64>,

    /// Whether learned patterns are contributed to the collective
    #[serde(default = "default_sharing")]
    pub sharing_enabled: bool,
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_sharing() -> bool {
    true
}

impl WorkerSpec {
    pub fn new(id: impl Into<WorkerId>, role: WorkerRole) -> Self {
        Self {
            id: id.into(),
            role,
            capabilities: BTreeSet::new(),
            specializations: Vec::new(),
            learning_rate: default_learning_rate(),
            autonomy: None,
            sharing_enabled: default_sharing(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_specialization(mut self, specialization: impl Into<String>) -> Self {
        self.specializations.push(specialization.into());
        self
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn with_autonomy(mut self, autonomy: f64) -> Self {
        self.autonomy = Some(autonomy);
        self
    }

    pub fn with_sharing(mut self, enabled: bool) -> Self {
        self.sharing_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(HiveError::InvalidWorkerSpec("worker id is empty".to_string()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 0.3) {
            return Err(HiveError::InvalidWorkerSpec(format!(
                "learning rate {} outside (0, 0.3]",
                self.learning_rate
            )));
        }
        if let Some(autonomy) = self.autonomy {
            if !(0.0..=1.0).contains(&autonomy) {
                return Err(HiveError::InvalidWorkerSpec(format!(
                    "autonomy {autonomy} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Role defaults merged with the declared capabilities.
    pub fn effective_capabilities(&self) -> BTreeSet<String> {
        self.role
            .default_capabilities()
            .iter()
            .map(|c| c.to_string())
            .chain(self.capabilities.iter().cloned())
            .collect()
    }
}

/// How a task ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { output: serde_json::Value },
    Partial { output: serde_json::Value, reason: String },
    Failure { error: String },
}

impl TaskOutcome {
    /// Score fed into the worker's performance average.
    pub fn score(&self) -> f64 {
        match self {
            Self::Success { .. } => 1.0,
            Self::Partial { .. } => 0.5,
            Self::Failure { .. } => 0.0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_str() {
        for role in WorkerRole::ALL {
            assert_eq!(role.as_str().parse::<WorkerRole>().unwrap(), role);
        }
        assert!("queen".parse::<WorkerRole>().is_err());
    }

    #[test]
    fn test_spec_validation() {
        assert!(WorkerSpec::new("w-1", WorkerRole::Tester).validate().is_ok());
        assert!(WorkerSpec::new("", WorkerRole::Tester).validate().is_err());
        assert!(WorkerSpec::new("w-1", WorkerRole::Tester)
            .with_learning_rate(0.0)
            .validate()
            .is_err());
        assert!(WorkerSpec::new("w-1", WorkerRole::Tester)
            .with_learning_rate(0.31)
            .validate()
            .is_err());
        assert!(WorkerSpec::new("w-1", WorkerRole::Tester)
            .with_autonomy(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_effective_capabilities_include_role_defaults() {
        let spec = WorkerSpec::new("w-1", WorkerRole::Implementer).with_capability("rust");
        let caps = spec.effective_capabilities();
        assert!(caps.contains("coding"));
        assert!(caps.contains("rust"));
    }

    #[test]
    fn test_status_gates() {
        assert!(WorkerStatus::Idle.is_available());
        assert!(!WorkerStatus::Busy.is_available());
        assert!(WorkerStatus::Busy.can_vote());
        assert!(!WorkerStatus::Paused.can_vote());
    }
}
