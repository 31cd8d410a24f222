//! Byzantine fault detection over a single voting round.

use crate::consensus::Vote;
use crate::node::ConsensusNode;
use crate::types::{NodeId, ProposalId};
use chrono::{DateTime, Utc};
use hivemind_config::ConsensusConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Justification confidence at or above which a vote claims full weight.
const MAX_WEIGHT_CONFIDENCE: f64 = 0.95;

/// Why a node was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Definitive vote backed by a near-zero justification
    InconsistentConfidence,
    /// Confident vote far from the round median
    Outlier,
    /// Flagged too often within the node's recent proposals
    HistoricalPattern,
    /// Under-trusted node repeatedly casting definitive max-confidence votes
    ReputationMismatch,
}

/// A recorded detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    pub node_id: NodeId,
    pub proposal_id: ProposalId,
    pub round: u32,
    pub kind: FaultKind,
    pub detected_at: DateTime<Utc>,
}

fn is_definitive(value: f64) -> bool {
    value <= 0.0 || value >= 1.0
}

/// Median of the round's vote values.
pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Evaluate every vote of one round. A node is reported at most once, with
/// the first rule it matched. Mismatch counters on `nodes` are advanced as a
/// side effect.
pub(crate) fn detect_faults(
    config: &ConsensusConfig,
    votes: &[Vote],
    nodes: &mut HashMap<NodeId, ConsensusNode>,
) -> Vec<(NodeId, FaultKind)> {
    let values: Vec<f64> = votes.iter().map(|v| v.value).collect();
    let Some(round_median) = median(&values) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut flagged = Vec::new();

    for vote in votes {
        if !seen.insert(vote.node_id.as_str()) {
            continue;
        }

        let confidence = vote.justification.confidence;
        let mut kind = None;

        if confidence < config.inconsistent_confidence && is_definitive(vote.value) {
            kind = Some(FaultKind::InconsistentConfidence);
        } else if (vote.value - round_median).abs() > config.outlier_deviation
            && confidence > config.outlier_confidence
        {
            kind = Some(FaultKind::Outlier);
        }

        if let Some(node) = nodes.get_mut(&vote.node_id) {
            if kind.is_none() && node.recent_faults() >= config.persistent_fault_limit {
                kind = Some(FaultKind::HistoricalPattern);
            }

            if node.reputation < config.low_reputation_threshold
                && is_definitive(vote.value)
                && confidence >= MAX_WEIGHT_CONFIDENCE
            {
                node.mismatch_count += 1;
                if kind.is_none() && node.mismatch_count >= config.mismatch_limit {
                    kind = Some(FaultKind::ReputationMismatch);
                }
            }
        }

        if let Some(kind) = kind {
            flagged.push((vote.node_id.clone(), kind));
        }
    }

    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Justification;

    fn vote(node: &str, value: f64, confidence: f64) -> Vote {
        Vote {
            node_id: node.to_string(),
            proposal_id: "p-1".to_string(),
            round: 1,
            value,
            weight: 0.5,
            justification: Justification::new(confidence, "test"),
            cast_at: Utc::now(),
        }
    }

    fn registry(ids: &[(&str, f64)]) -> HashMap<NodeId, ConsensusNode> {
        ids.iter()
            .map(|(id, rep)| (id.to_string(), ConsensusNode::new(*id, *rep)))
            .collect()
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[0.3]), Some(0.3));
        assert_eq!(median(&[0.9, 0.1, 0.5]), Some(0.5));
        assert_eq!(median(&[0.2, 0.4, 0.6, 0.8]), Some(0.5));
    }

    #[test]
    fn test_inconsistent_confidence() {
        let config = ConsensusConfig::default();
        let mut nodes = registry(&[("a", 0.5), ("b", 0.5), ("c", 0.5)]);
        let votes = vec![vote("a", 1.0, 0.1), vote("b", 0.6, 0.1), vote("c", 0.6, 0.6)];

        let flagged = detect_faults(&config, &votes, &mut nodes);
        assert_eq!(flagged, vec![("a".to_string(), FaultKind::InconsistentConfidence)]);
    }

    #[test]
    fn test_confident_outlier() {
        let config = ConsensusConfig::default();
        let mut nodes = registry(&[("a", 0.5), ("b", 0.5), ("c", 0.5), ("d", 0.5)]);
        let votes = vec![
            vote("a", 0.8, 0.8),
            vote("b", 0.8, 0.8),
            vote("c", 0.75, 0.8),
            vote("d", 0.1, 0.9),
        ];

        let flagged = detect_faults(&config, &votes, &mut nodes);
        assert_eq!(flagged, vec![("d".to_string(), FaultKind::Outlier)]);
    }

    #[test]
    fn test_unconfident_outlier_is_tolerated() {
        let config = ConsensusConfig::default();
        let mut nodes = registry(&[("a", 0.5), ("b", 0.5), ("c", 0.5)]);
        let votes = vec![vote("a", 0.9, 0.8), vote("b", 0.9, 0.8), vote("c", 0.2, 0.5)];

        assert!(detect_faults(&config, &votes, &mut nodes).is_empty());
    }

    #[test]
    fn test_reputation_mismatch_needs_repetition() {
        let config = ConsensusConfig::default();
        let mut nodes = registry(&[("a", 0.3), ("b", 0.5), ("c", 0.5)]);
        let votes = vec![vote("a", 1.0, 1.0), vote("b", 1.0, 0.6), vote("c", 1.0, 0.6)];

        assert!(detect_faults(&config, &votes, &mut nodes).is_empty());
        assert_eq!(nodes["a"].mismatch_count, 1);

        let flagged = detect_faults(&config, &votes, &mut nodes);
        assert_eq!(flagged, vec![("a".to_string(), FaultKind::ReputationMismatch)]);
    }

    #[test]
    fn test_historical_pattern() {
        let config = ConsensusConfig::default();
        let mut nodes = registry(&[("a", 0.9), ("b", 0.5), ("c", 0.5)]);
        if let Some(node) = nodes.get_mut("a") {
            node.fault_history.extend([true, false, true, true]);
        }
        let votes = vec![vote("a", 0.7, 0.6), vote("b", 0.7, 0.6), vote("c", 0.7, 0.6)];

        let flagged = detect_faults(&config, &votes, &mut nodes);
        assert_eq!(flagged, vec![("a".to_string(), FaultKind::HistoricalPattern)]);
    }
}
