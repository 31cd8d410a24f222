//! Pattern payloads, contributions and validated patterns.

use crate::capability::WorkerRole;
use crate::types::{clamp_unit, HiveError, ProposalId, Result, Signature, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step of a pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PatternAction {
    /// Tool or operation name; part of the signature
    pub name: String,

    /// Parameters or notes; distinguishes variants sharing a signature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PatternAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A candidate pattern as produced by extraction or merging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternDraft {
    pub pattern_type: String,
    pub actions: Vec<PatternAction>,

    /// In `[0, 1]`
    pub confidence: f64,

    /// In `[0, 1]`
    pub quality: f64,

    /// Roles or specializations this pattern is useful for
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<u64>,
}

impl PatternDraft {
    pub fn new(pattern_type: impl Into<String>, actions: Vec<PatternAction>) -> Self {
        Self {
            pattern_type: pattern_type.into(),
            actions,
            confidence: 0.5,
            quality: 0.5,
            tags: Vec::new(),
            avg_duration_ms: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Reject drafts missing structural fields or carrying out-of-range scores.
    pub fn validate(&self) -> Result<()> {
        if self.pattern_type.trim().is_empty() {
            return Err(HiveError::InvalidPattern("pattern type is empty".to_string()));
        }
        if self.actions.is_empty() {
            return Err(HiveError::InvalidPattern("pattern has no actions".to_string()));
        }
        if self.actions.iter().any(|a| a.name.trim().is_empty()) {
            return Err(HiveError::InvalidPattern("action without a name".to_string()));
        }
        for (field, value) in [("confidence", self.confidence), ("quality", self.quality)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(HiveError::InvalidPattern(format!("{field} {value} outside [0, 1]")));
            }
        }
        Ok(())
    }

    /// Stable hash of the structural fields: type plus ordered action names.
    /// Scores, timing, tags and action details do not participate.
    pub fn signature(&self) -> Signature {
        let mut hasher = blake3::Hasher::new();
        hash_field(&mut hasher, &self.pattern_type);
        hasher.update(&(self.actions.len() as u64).to_le_bytes());
        for action in &self.actions {
            hash_field(&mut hasher, &action.name);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Key of the full action sequence, details included. Contributions
    /// sharing a signature but not this key are semantically incompatible.
    pub fn variant_key(&self) -> String {
        self.actions
            .iter()
            .map(|a| match &a.detail {
                Some(detail) => format!("{}({})", a.name, detail),
                None => a.name.clone(),
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Whether this draft is relevant to a worker with `role` and
    /// `specializations`. Untagged drafts apply to everyone.
    pub fn applies_to(&self, role: WorkerRole, specializations: &[String]) -> bool {
        if self.tags.is_empty() {
            return true;
        }
        self.tags.iter().any(|tag| {
            tag.eq_ignore_ascii_case(role.as_str())
                || specializations.iter().any(|s| s.eq_ignore_ascii_case(tag))
        }) || specializations
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&self.pattern_type))
    }
}

/// A worker's submission to the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternContribution {
    pub id: String,
    pub contributor_id: WorkerId,
    pub contributor_role: WorkerRole,
    pub draft: PatternDraft,

    /// Contributor's own quality estimate, in `[0, 1]`
    pub score: f64,

    pub submitted_at: DateTime<Utc>,
}

impl PatternContribution {
    pub fn new(
        contributor_id: impl Into<WorkerId>,
        contributor_role: WorkerRole,
        draft: PatternDraft,
        score: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            contributor_id: contributor_id.into(),
            contributor_role,
            draft,
            score: clamp_unit(score),
            submitted_at: Utc::now(),
        }
    }

    pub fn signature(&self) -> Signature {
        self.draft.signature()
    }
}

/// How a pattern group was turned into candidates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Low variance, reputation-and-score weighted average
    Merge,
    /// The clearly most reputable contributor's version wins
    DeferToExpert,
    /// One candidate per incompatible action sequence
    CreateVariant,
    /// Conflicting versions settled by the group's vote
    Vote,
}

/// What the aggregator asks the consensus engine to validate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternCandidate {
    pub signature: Signature,
    pub draft: PatternDraft,
    pub contributors: Vec<WorkerId>,
    pub strategy: ResolutionStrategy,
}

/// A pattern the collective has agreed on. Never mutated once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedPattern {
    pub id: String,
    pub signature: Signature,
    pub pattern: PatternDraft,

    /// Collective confidence after merging
    pub confidence: f64,

    pub contributors: Vec<WorkerId>,

    /// Weighted affirmative fraction of the resolving round
    pub consensus_score: f64,

    pub strategy: ResolutionStrategy,
    pub proposal_id: ProposalId,
    pub validated_at: DateTime<Utc>,
}

impl ValidatedPattern {
    pub(crate) fn from_candidate(
        candidate: PatternCandidate,
        proposal_id: ProposalId,
        consensus_score: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            signature: candidate.signature,
            confidence: candidate.draft.confidence,
            pattern: candidate.draft,
            contributors: candidate.contributors,
            consensus_score,
            strategy: candidate.strategy,
            proposal_id,
            validated_at: Utc::now(),
        }
    }
}

/// Length-prefixed so that no two field sequences hash the same bytes.
fn hash_field(hasher: &mut blake3::Hasher, field: &str) {
    hasher.update(&(field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(actions: &[&str]) -> PatternDraft {
        PatternDraft::new(
            "bugfix",
            actions.iter().map(|a| PatternAction::new(*a)).collect(),
        )
    }

    #[test]
    fn test_signature_ignores_volatile_fields() {
        let a = draft(&["read", "edit", "test"]).with_confidence(0.8);
        let mut b = draft(&["read", "edit", "test"])
            .with_confidence(0.95)
            .with_quality(0.1)
            .with_tag("tester");
        b.avg_duration_ms = Some(1200);
        b.actions[1].detail = Some("src/lib.rs".to_string());

        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.variant_key(), b.variant_key());
    }

    #[test]
    fn test_signature_depends_on_order_and_type() {
        let a = draft(&["read", "edit"]);
        let b = draft(&["edit", "read"]);
        let mut c = draft(&["read", "edit"]);
        c.pattern_type = "feature".to_string();

        assert_ne!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
        // Concatenation must not collide.
        assert_ne!(draft(&["ab", "c"]).signature(), draft(&["a", "bc"]).signature());
    }

    #[test]
    fn test_signature_survives_separator_bytes_in_names() {
        assert_ne!(draft(&["a\u{1f}b"]).signature(), draft(&["a", "b"]).signature());

        let mut merged = draft(&["b"]);
        merged.pattern_type = "bugfix\u{1f}a".to_string();
        assert_ne!(merged.signature(), draft(&["a", "b"]).signature());
    }

    #[test]
    fn test_validation() {
        assert!(draft(&["read"]).validate().is_ok());
        assert!(draft(&[]).validate().is_err());
        assert!(draft(&[""]).validate().is_err());
        assert!(draft(&["read"]).with_confidence(1.2).validate().is_err());
        assert!(draft(&["read"]).with_quality(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_applies_to() {
        let untagged = draft(&["read"]);
        assert!(untagged.applies_to(WorkerRole::Tester, &[]));

        let tagged = draft(&["read"]).with_tag("reviewer");
        assert!(tagged.applies_to(WorkerRole::Reviewer, &[]));
        assert!(!tagged.applies_to(WorkerRole::Tester, &[]));
        assert!(tagged.applies_to(WorkerRole::Tester, &["Reviewer".to_string()]));
        assert!(tagged.applies_to(WorkerRole::Tester, &["bugfix".to_string()]));
    }
}
