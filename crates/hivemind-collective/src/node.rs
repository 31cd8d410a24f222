//! Consensus node registry.
//!
//! Nodes live in an arena keyed by id. The engine takes the write lock only
//! while tallying and applying reputation changes; status queries read.

use crate::consensus::Voter;
use crate::types::{clamp_unit, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Trust record for one voting participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusNode {
    pub id: NodeId,

    /// Trust score in `[0, 1]`
    pub reputation: f64,

    /// Excluded from eligible sets, votes and contributions
    pub quarantined: bool,

    /// Set once the node is flagged too often within its history window
    pub persistent_suspicion: bool,

    /// Set when a round flags the node; cleared only by an explicit release
    pub fault_hold: bool,

    /// Fault flag per participated proposal, oldest first
    pub fault_history: VecDeque<bool>,

    /// Definitive max-confidence votes cast while under-trusted
    pub mismatch_count: u32,

    pub proposals_participated: u64,

    pub registered_at: DateTime<Utc>,
}

impl ConsensusNode {
    pub fn new(id: impl Into<NodeId>, reputation: f64) -> Self {
        Self {
            id: id.into(),
            reputation: clamp_unit(reputation),
            quarantined: false,
            persistent_suspicion: false,
            fault_hold: false,
            fault_history: VecDeque::new(),
            mismatch_count: 0,
            proposals_participated: 0,
            registered_at: Utc::now(),
        }
    }

    /// Flags within the remembered window.
    pub fn recent_faults(&self) -> usize {
        self.fault_history.iter().filter(|flagged| **flagged).count()
    }

    pub(crate) fn reward(&mut self, gain: f64) {
        self.reputation = clamp_unit(self.reputation + gain);
    }

    pub(crate) fn penalize(&mut self, penalty: f64) {
        self.reputation = clamp_unit(self.reputation - penalty);
    }

    /// Push one proposal outcome into the window. Returns `true` when this
    /// push tipped the node into persistent suspicion.
    pub(crate) fn record_participation(
        &mut self,
        flagged: bool,
        window: usize,
        fault_limit: usize,
    ) -> bool {
        self.proposals_participated += 1;
        self.fault_history.push_back(flagged);
        while self.fault_history.len() > window {
            self.fault_history.pop_front();
        }

        if !self.persistent_suspicion && self.recent_faults() >= fault_limit {
            self.persistent_suspicion = true;
            return true;
        }
        false
    }

    /// Quarantine on a fault flag. Returns `true` on a fresh quarantine.
    pub(crate) fn hold_for_fault(&mut self) -> bool {
        self.fault_hold = true;
        let fresh = !self.quarantined;
        self.quarantined = true;
        fresh
    }

    /// Re-derive the quarantine flag. Returns `true` on a fresh quarantine.
    pub(crate) fn refresh_quarantine(&mut self, threshold: f64) -> bool {
        let should = self.reputation < threshold || self.persistent_suspicion || self.fault_hold;
        let fresh = should && !self.quarantined;
        self.quarantined = should;
        fresh
    }
}

/// Arena of nodes and the voters that speak for them.
#[derive(Default)]
pub(crate) struct NodeRegistry {
    pub(crate) nodes: HashMap<NodeId, ConsensusNode>,
    pub(crate) voters: HashMap<NodeId, Arc<dyn Voter>>,

    /// Records of nodes that left while quarantined, restored on re-entry
    pub(crate) departed: HashMap<NodeId, ConsensusNode>,
}

impl NodeRegistry {
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub(crate) fn insert(&mut self, node: ConsensusNode, voter: Arc<dyn Voter>) {
        self.voters.insert(node.id.clone(), voter);
        self.nodes.insert(node.id.clone(), node);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<ConsensusNode> {
        self.voters.remove(id);
        let node = self.nodes.remove(id)?;
        if node.quarantined {
            self.departed.insert(node.id.clone(), node.clone());
        }
        Some(node)
    }

    /// Take back the record of a node that left while quarantined.
    pub(crate) fn take_departed(&mut self, id: &str) -> Option<ConsensusNode> {
        self.departed.remove(id)
    }

    pub(crate) fn is_quarantined(&self, id: &str) -> bool {
        self.nodes.get(id).map(|n| n.quarantined).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reputation_is_clamped() {
        let mut node = ConsensusNode::new("n-1", 0.98);
        node.reward(0.05);
        assert_eq!(node.reputation, 1.0);

        node.penalize(0.3);
        node.penalize(0.3);
        node.penalize(0.3);
        node.penalize(0.3);
        assert_eq!(node.reputation, 0.0);

        let node = ConsensusNode::new("n-2", 7.0);
        assert_eq!(node.reputation, 1.0);
    }

    #[test]
    fn test_history_window_is_bounded() {
        let mut node = ConsensusNode::new("n-1", 0.5);
        for _ in 0..15 {
            node.record_participation(false, 10, 3);
        }
        assert_eq!(node.fault_history.len(), 10);
        assert_eq!(node.proposals_participated, 15);
        assert!(!node.persistent_suspicion);
    }

    #[test]
    fn test_persistent_suspicion_fires_once() {
        let mut node = ConsensusNode::new("n-1", 0.9);
        assert!(!node.record_participation(true, 10, 3));
        assert!(!node.record_participation(false, 10, 3));
        assert!(!node.record_participation(true, 10, 3));
        assert!(node.record_participation(true, 10, 3));
        assert!(!node.record_participation(true, 10, 3));

        assert!(node.refresh_quarantine(0.2));
        assert!(node.quarantined);
        assert!(node.reputation >= 0.2);
    }

    #[test]
    fn test_fault_hold_survives_refresh() {
        let mut node = ConsensusNode::new("n-1", 0.9);
        assert!(node.hold_for_fault());
        assert!(!node.hold_for_fault());
        assert!(!node.refresh_quarantine(0.2));
        assert!(node.quarantined);

        node.fault_hold = false;
        node.refresh_quarantine(0.2);
        assert!(!node.quarantined);
    }

    #[test]
    fn test_quarantined_record_is_kept_on_removal() {
        struct Mute;

        #[async_trait::async_trait]
        impl Voter for Mute {
            async fn cast_vote(
                &self,
                _request: &crate::consensus::BallotRequest,
            ) -> Option<crate::consensus::Ballot> {
                None
            }
        }

        let mut registry = NodeRegistry::default();
        let mut held = ConsensusNode::new("n-1", 0.9);
        held.hold_for_fault();
        registry.insert(held, Arc::new(Mute));
        registry.insert(ConsensusNode::new("n-2", 0.9), Arc::new(Mute));

        registry.remove("n-1");
        registry.remove("n-2");
        assert!(registry.take_departed("n-2").is_none());
        let restored = registry.take_departed("n-1").unwrap();
        assert!(restored.quarantined && restored.fault_hold);
        assert!(registry.take_departed("n-1").is_none());
    }

    #[test]
    fn test_quarantine_tracks_reputation() {
        let mut node = ConsensusNode::new("n-1", 0.25);
        assert!(!node.refresh_quarantine(0.2));
        node.penalize(0.1);
        assert!(node.refresh_quarantine(0.2));
        assert!(!node.refresh_quarantine(0.2));
    }
}
