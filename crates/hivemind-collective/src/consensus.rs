//! Byzantine fault-tolerant consensus over weighted votes.
//!
//! A proposal runs up to `max_rounds` strictly ordered rounds. Each round
//! broadcasts a [`BallotRequest`] to every eligible node concurrently and
//! waits at most `round_timeout` for ballots. Non-responders abstain.
//!
//! A round that reaches quorum is tallied as a weighted affirmative
//! fraction. When that falls short of the consensus threshold, fault
//! detection runs over the round's votes; flagged nodes are dropped from the
//! proposal and the remaining votes are re-tallied while the round window is
//! still open.
//!
//! Reputation changes are applied in one critical section once the proposal
//! is terminal.

use crate::events::{EventBus, HiveEvent};
use crate::fault::{detect_faults, FaultKind, FaultRecord};
use crate::lifecycle::Lifecycle;
use crate::node::{ConsensusNode, NodeRegistry};
use crate::types::{clamp_unit, HiveError, NodeId, ProposalId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use hivemind_config::ConsensusConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a proposal asks the hive to decide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    /// Accept a merged pattern into the collective library
    PatternValidation,
    /// Approve a resource allocation plan
    ResourceAllocation,
    /// Ratify a queen directive
    Directive,
    /// Custom proposal type
    Custom(String),
}

/// Lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Why a voter voted the way it did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Justification {
    /// How sure the voter is, in `[0, 1]`
    pub confidence: f64,
    pub reason: String,
}

impl Justification {
    pub fn new(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            confidence: clamp_unit(confidence),
            reason: reason.into(),
        }
    }
}

/// A voter's answer to a [`BallotRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ballot {
    /// Support for the proposal, in `[0, 1]`
    pub value: f64,
    pub justification: Justification,
}

impl Ballot {
    pub fn new(value: f64, confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            value,
            justification: Justification::new(confidence, reason),
        }
    }
}

/// What gets broadcast to each eligible node at the start of a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotRequest {
    pub proposal_id: ProposalId,
    pub proposal_type: ProposalType,
    pub payload: serde_json::Value,
    pub round: u32,
    pub node_id: NodeId,
}

/// Anything that can vote on behalf of a consensus node.
///
/// Returning `None` is an abstention. Implementations that never return are
/// treated as abstaining once the round window closes.
#[async_trait]
pub trait Voter: Send + Sync {
    async fn cast_vote(&self, request: &BallotRequest) -> Option<Ballot>;
}

/// Voter held weakly so the registry does not keep its owner alive. Abstains
/// once the owner is gone.
pub struct WeakVoter<V: ?Sized>(Weak<V>);

impl<V: ?Sized> WeakVoter<V> {
    pub fn new(owner: &Arc<V>) -> Self {
        Self(Arc::downgrade(owner))
    }
}

#[async_trait]
impl<V: Voter + ?Sized> Voter for WeakVoter<V> {
    async fn cast_vote(&self, request: &BallotRequest) -> Option<Ballot> {
        let owner = self.0.upgrade()?;
        owner.cast_vote(request).await
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub node_id: NodeId,
    pub proposal_id: ProposalId,
    pub round: u32,
    pub value: f64,

    /// Voter's reputation when the ballot arrived
    pub weight: f64,

    pub justification: Justification,
    pub cast_at: DateTime<Utc>,
}

/// What happened in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u32,
    pub participation: f64,

    /// Final weighted affirmative fraction, absent when quorum failed
    pub affirmative: Option<f64>,

    pub quorum_met: bool,
    pub flagged: Vec<NodeId>,
}

/// A proposal and its vote ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub proposal_type: ProposalType,
    pub payload: serde_json::Value,

    /// Nodes still allowed to vote
    pub eligible: Vec<NodeId>,

    /// Last round started, `0` before the first broadcast
    pub round: u32,

    pub status: ProposalStatus,
    pub votes: Vec<Vote>,
    pub rounds: Vec<RoundSummary>,
    pub flagged: HashMap<NodeId, FaultKind>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Proposal {
    fn new(proposal_type: ProposalType, payload: serde_json::Value, eligible: Vec<NodeId>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_type,
            payload,
            eligible,
            round: 0,
            status: ProposalStatus::Pending,
            votes: Vec::new(),
            rounds: Vec::new(),
            flagged: HashMap::new(),
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Terminal result handed back to the submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalOutcome {
    pub proposal_id: ProposalId,
    pub status: ProposalStatus,
    pub rounds_used: u32,

    /// Weighted affirmative fraction of the resolving round
    pub affirmative: f64,

    pub participation: f64,
    pub flagged: Vec<NodeId>,
}

impl ProposalOutcome {
    pub fn is_approved(&self) -> bool {
        self.status == ProposalStatus::Approved
    }

    /// Surface a timed-out proposal as [`HiveError::ConsensusTimeout`].
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            ProposalStatus::TimedOut => Err(HiveError::ConsensusTimeout(self.proposal_id)),
            _ => Ok(self),
        }
    }
}

/// Counters returned by [`ConsensusEngine::get_metrics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsensusMetrics {
    pub total_proposals: u64,
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub average_consensus_time_ms: f64,
    pub byzantine_faults_detected: u64,
}

#[derive(Debug, Default)]
struct MetricsState {
    total: u64,
    approved: u64,
    rejected: u64,
    timed_out: u64,
    resolved_time_ms: u128,
    faults: u64,
}

/// Weighted affirmative fraction:
/// `Σ(value × weight | value ≥ 0.5) / Σ(weight)`.
pub fn weighted_affirmative(votes: &[Vote]) -> f64 {
    let total: f64 = votes.iter().map(|v| v.weight).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let support: f64 = votes
        .iter()
        .filter(|v| v.value >= 0.5)
        .map(|v| v.value * v.weight)
        .sum();
    support / total
}

/// Per-round tally state, local to one proposal.
struct RoundTally {
    participation: f64,
    affirmative: Option<f64>,
    flagged: Vec<(NodeId, FaultKind)>,
}

/// Node registry plus the multi-round voting state machine.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    registry: RwLock<NodeRegistry>,
    proposals: RwLock<HashMap<ProposalId, Proposal>>,
    faults: RwLock<Vec<FaultRecord>>,
    metrics: RwLock<MetricsState>,
    events: EventBus,
    lifecycle: Lifecycle,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig, events: EventBus, lifecycle: Lifecycle) -> Self {
        Self {
            config,
            registry: RwLock::new(NodeRegistry::default()),
            proposals: RwLock::new(HashMap::new()),
            faults: RwLock::new(Vec::new()),
            metrics: RwLock::new(MetricsState::default()),
            events,
            lifecycle,
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Register a node at the configured default reputation.
    pub async fn register_node(&self, id: impl Into<NodeId>, voter: Arc<dyn Voter>) -> Result<()> {
        let reputation = self.config.default_reputation;
        self.register_node_with_reputation(id, reputation, voter)
            .await
    }

    pub async fn register_node_with_reputation(
        &self,
        id: impl Into<NodeId>,
        reputation: f64,
        voter: Arc<dyn Voter>,
    ) -> Result<()> {
        if self.lifecycle.is_shutting_down() {
            return Err(HiveError::ShuttingDown);
        }

        let id = id.into();
        let mut registry = self.registry.write().await;
        if registry.contains(&id) {
            return Err(HiveError::DuplicateNode(id));
        }

        let node = match registry.take_departed(&id) {
            Some(node) => {
                warn!(node_id = %id, reputation = node.reputation, "Re-registered node stays quarantined");
                node
            }
            None => {
                let mut node = ConsensusNode::new(id.clone(), reputation);
                node.refresh_quarantine(self.config.quarantine_threshold);
                info!(node_id = %id, reputation = node.reputation, "Registered consensus node");
                node
            }
        };
        registry.insert(node, voter);
        Ok(())
    }

    /// Lift the fault hold on a node. The node stays quarantined while its
    /// reputation is under the threshold or it is persistently suspicious;
    /// returns whether it may vote again.
    pub async fn release_node(&self, id: &str) -> Result<bool> {
        let mut registry = self.registry.write().await;
        let node = registry
            .nodes
            .get_mut(id)
            .ok_or_else(|| HiveError::UnknownNode(id.to_string()))?;

        node.fault_hold = false;
        node.refresh_quarantine(self.config.quarantine_threshold);
        let released = !node.quarantined;
        info!(
            node_id = %id,
            reputation = node.reputation,
            persistent_suspicion = node.persistent_suspicion,
            released,
            "Fault hold lifted"
        );
        Ok(released)
    }

    pub async fn deregister_node(&self, id: &str) -> Result<ConsensusNode> {
        let removed = self.registry.write().await.remove(id);
        match removed {
            Some(node) => {
                info!(node_id = %id, "Deregistered consensus node");
                Ok(node)
            }
            None => Err(HiveError::UnknownNode(id.to_string())),
        }
    }

    pub async fn node(&self, id: &str) -> Option<ConsensusNode> {
        self.registry.read().await.nodes.get(id).cloned()
    }

    pub async fn nodes(&self) -> Vec<ConsensusNode> {
        let registry = self.registry.read().await;
        let mut nodes: Vec<_> = registry.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        let registry = self.registry.read().await;
        let mut ids: Vec<_> = registry.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of every node that may currently vote.
    pub async fn eligible_node_ids(&self) -> Vec<NodeId> {
        let registry = self.registry.read().await;
        let mut ids: Vec<_> = registry
            .nodes
            .values()
            .filter(|n| !n.quarantined)
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn node_count(&self) -> usize {
        self.registry.read().await.nodes.len()
    }

    pub async fn reputation(&self, id: &str) -> Option<f64> {
        self.registry.read().await.nodes.get(id).map(|n| n.reputation)
    }

    pub async fn is_quarantined(&self, id: &str) -> bool {
        self.registry.read().await.is_quarantined(id)
    }

    /// Mean reputation over all registered nodes, `0.0` when empty.
    pub async fn average_reputation(&self) -> f64 {
        let registry = self.registry.read().await;
        if registry.nodes.is_empty() {
            return 0.0;
        }
        registry.nodes.values().map(|n| n.reputation).sum::<f64>() / registry.nodes.len() as f64
    }

    pub async fn proposal(&self, id: &str) -> Option<Proposal> {
        self.proposals.read().await.get(id).cloned()
    }

    /// Faults detected at or after `since`.
    pub async fn faults_since(&self, since: DateTime<Utc>) -> Vec<FaultRecord> {
        self.faults
            .read()
            .await
            .iter()
            .filter(|f| f.detected_at >= since)
            .cloned()
            .collect()
    }

    pub async fn fault_log(&self) -> Vec<FaultRecord> {
        self.faults.read().await.clone()
    }

    pub async fn get_metrics(&self) -> ConsensusMetrics {
        let state = self.metrics.read().await;
        let resolved = state.approved + state.rejected + state.timed_out;
        let average_consensus_time_ms = if resolved == 0 {
            0.0
        } else {
            state.resolved_time_ms as f64 / resolved as f64
        };

        ConsensusMetrics {
            total_proposals: state.total,
            approved: state.approved,
            rejected: state.rejected,
            timed_out: state.timed_out,
            average_consensus_time_ms,
            byzantine_faults_detected: state.faults,
        }
    }

    /// Run a proposal to a terminal state.
    ///
    /// Unknown and quarantined ids are dropped from `eligible_ids`. Fails with
    /// [`HiveError::InsufficientNodes`] when fewer than `min_nodes` remain.
    pub async fn submit_proposal(
        &self,
        proposal_type: ProposalType,
        payload: serde_json::Value,
        eligible_ids: &[NodeId],
    ) -> Result<ProposalOutcome> {
        if self.lifecycle.is_shutting_down() {
            return Err(HiveError::ShuttingDown);
        }

        let eligible = self.filter_eligible(eligible_ids).await;
        if eligible.len() < self.config.min_nodes {
            return Err(HiveError::InsufficientNodes {
                required: self.config.min_nodes,
                actual: eligible.len(),
            });
        }

        let proposal = Proposal::new(proposal_type, payload, eligible);
        let proposal_id = proposal.id.clone();
        info!(
            proposal_id = %proposal_id,
            proposal_type = ?proposal.proposal_type,
            eligible = proposal.eligible.len(),
            "Proposal submitted"
        );

        self.metrics.write().await.total += 1;
        self.proposals
            .write()
            .await
            .insert(proposal_id.clone(), proposal.clone());

        self.lifecycle.track(self.run_proposal(proposal)).await
    }

    async fn filter_eligible(&self, ids: &[NodeId]) -> Vec<NodeId> {
        let registry = self.registry.read().await;
        let mut seen = HashSet::new();
        let mut eligible = Vec::with_capacity(ids.len());

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match registry.nodes.get(id) {
                Some(node) if node.quarantined => {
                    debug!(node_id = %id, "Skipping quarantined node");
                }
                Some(_) => eligible.push(id.clone()),
                None => {
                    warn!(error = %HiveError::UnknownNode(id.clone()), "Skipping unknown node");
                }
            }
        }

        eligible
    }

    async fn run_proposal(&self, proposal: Proposal) -> Result<ProposalOutcome> {
        let started = Instant::now();
        let proposal_id = proposal.id.clone();
        let mut eligible = proposal.eligible.clone();
        let mut flagged: HashMap<NodeId, FaultKind> = HashMap::new();
        let mut quorum_reached = false;
        let mut approved = false;
        let mut interrupted = false;
        let mut rounds_used = 0;
        let mut last_participation = 0.0;
        let mut last_affirmative = 0.0;

        for round in 1..=self.config.max_rounds {
            if round > 1 {
                self.drop_quarantined(&mut eligible).await;
            }
            if eligible.is_empty() {
                break;
            }
            rounds_used = round;
            let deadline = Instant::now() + self.config.round_timeout();

            let Some(votes) = self.collect_votes(&proposal, round, &eligible, deadline).await else {
                warn!(proposal_id = %proposal_id, round, "Proposal interrupted by shutdown");
                interrupted = true;
                break;
            };

            let tally = self.tally_round(&proposal_id, round, &eligible, &votes, deadline).await;
            last_participation = tally.participation;

            let newly_flagged: Vec<NodeId> = tally.flagged.iter().map(|(id, _)| id.clone()).collect();
            for (id, kind) in &tally.flagged {
                flagged.insert(id.clone(), *kind);
            }
            eligible.retain(|id| !flagged.contains_key(id));

            if let Some(affirmative) = tally.affirmative {
                quorum_reached = true;
                last_affirmative = affirmative;
                approved = affirmative >= self.config.consensus_threshold;
            }

            self.record_round(
                &proposal_id,
                votes,
                RoundSummary {
                    round,
                    participation: tally.participation,
                    affirmative: tally.affirmative,
                    quorum_met: tally.affirmative.is_some(),
                    flagged: newly_flagged,
                },
                &eligible,
            )
            .await;

            if approved {
                break;
            }
        }

        // An interrupted proposal never takes the direction of an earlier round
        let status = if interrupted {
            ProposalStatus::TimedOut
        } else if approved {
            ProposalStatus::Approved
        } else if quorum_reached {
            ProposalStatus::Rejected
        } else {
            ProposalStatus::TimedOut
        };

        self.resolve(&proposal_id, status, &flagged).await;

        let elapsed_ms = started.elapsed().as_millis();
        {
            let mut metrics = self.metrics.write().await;
            metrics.resolved_time_ms += elapsed_ms;
            match status {
                ProposalStatus::Approved => metrics.approved += 1,
                ProposalStatus::Rejected => metrics.rejected += 1,
                ProposalStatus::TimedOut => metrics.timed_out += 1,
                ProposalStatus::Pending => {}
            }
        }

        info!(
            proposal_id = %proposal_id,
            status = ?status,
            rounds_used,
            affirmative = last_affirmative,
            elapsed_ms = elapsed_ms as u64,
            "Proposal resolved"
        );
        self.events.publish(HiveEvent::ProposalResolved {
            proposal_id: proposal_id.clone(),
            status,
            rounds_used,
            affirmative: last_affirmative,
        });

        let mut flagged_ids: Vec<NodeId> = flagged.into_keys().collect();
        flagged_ids.sort();

        Ok(ProposalOutcome {
            proposal_id,
            status,
            rounds_used,
            affirmative: last_affirmative,
            participation: last_participation,
            flagged: flagged_ids,
        })
    }

    /// Nodes quarantined by a concurrent proposal leave this one too.
    async fn drop_quarantined(&self, eligible: &mut Vec<NodeId>) {
        let registry = self.registry.read().await;
        eligible.retain(|id| !registry.is_quarantined(id));
    }

    /// Broadcast one round and gather ballots until `deadline`. Returns
    /// `None` when the hive is cancelled mid-round.
    async fn collect_votes(
        &self,
        proposal: &Proposal,
        round: u32,
        eligible: &[NodeId],
        deadline: Instant,
    ) -> Option<Vec<Vote>> {
        let voters: Vec<(NodeId, Arc<dyn Voter>)> = {
            let registry = self.registry.read().await;
            eligible
                .iter()
                .filter_map(|id| registry.voters.get(id).map(|v| (id.clone(), Arc::clone(v))))
                .collect()
        };

        let handles = voters.into_iter().map(|(node_id, voter)| {
            let request = BallotRequest {
                proposal_id: proposal.id.clone(),
                proposal_type: proposal.proposal_type.clone(),
                payload: proposal.payload.clone(),
                round,
                node_id: node_id.clone(),
            };
            tokio::spawn(async move {
                let ballot = tokio::time::timeout_at(deadline, voter.cast_vote(&request))
                    .await
                    .ok()
                    .flatten();
                (node_id, ballot)
            })
        });

        let results = tokio::select! {
            results = join_all(handles) => results,
            _ = self.lifecycle.token().cancelled() => return None,
        };

        let registry = self.registry.read().await;
        let votes = results
            .into_iter()
            .filter_map(|joined| match joined {
                Ok((node_id, Some(ballot))) if !ballot.value.is_nan() => {
                    let weight = registry.nodes.get(&node_id)?.reputation;
                    Some(Vote {
                        node_id,
                        proposal_id: proposal.id.clone(),
                        round,
                        value: clamp_unit(ballot.value),
                        weight,
                        justification: ballot.justification,
                        cast_at: Utc::now(),
                    })
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(proposal_id = %proposal.id, round, error = %e, "Voter task failed");
                    None
                }
            })
            .collect();

        Some(votes)
    }

    /// Quorum check, tally, fault detection and re-tally for one round.
    async fn tally_round(
        &self,
        proposal_id: &str,
        round: u32,
        eligible: &[NodeId],
        votes: &[Vote],
        deadline: Instant,
    ) -> RoundTally {
        let participation = votes.len() as f64 / eligible.len() as f64;
        if participation < self.config.quorum_threshold {
            let error = HiveError::QuorumNotMet {
                required: self.config.quorum_threshold,
                actual: participation,
            };
            debug!(proposal_id = %proposal_id, round, %error, "Round failed");
            return RoundTally {
                participation,
                affirmative: None,
                flagged: Vec::new(),
            };
        }

        let affirmative = weighted_affirmative(votes);
        debug!(proposal_id = %proposal_id, round, participation, affirmative, "Round tallied");
        if affirmative >= self.config.consensus_threshold {
            return RoundTally {
                participation,
                affirmative: Some(affirmative),
                flagged: Vec::new(),
            };
        }

        let (flagged, held) = {
            let mut registry = self.registry.write().await;
            let flagged = detect_faults(&self.config, votes, &mut registry.nodes);
            let mut held = Vec::new();
            for (id, kind) in &flagged {
                if let Some(node) = registry.nodes.get_mut(id) {
                    if node.hold_for_fault() {
                        held.push((id.clone(), node.reputation, *kind));
                    }
                }
            }
            (flagged, held)
        };
        for (node_id, reputation, kind) in held {
            warn!(proposal_id = %proposal_id, round, node_id = %node_id, reputation, "Node quarantined");
            self.events.publish(HiveEvent::NodeQuarantined {
                node_id,
                reputation,
                reason: Some(kind),
            });
        }
        if flagged.is_empty() {
            return RoundTally {
                participation,
                affirmative: Some(affirmative),
                flagged,
            };
        }

        self.record_faults(proposal_id, round, &flagged).await;

        if Instant::now() >= deadline {
            return RoundTally {
                participation,
                affirmative: Some(affirmative),
                flagged,
            };
        }

        let flagged_ids: HashSet<&str> = flagged.iter().map(|(id, _)| id.as_str()).collect();
        let remaining_votes: Vec<Vote> = votes
            .iter()
            .filter(|v| !flagged_ids.contains(v.node_id.as_str()))
            .cloned()
            .collect();
        let remaining_eligible = eligible
            .iter()
            .filter(|id| !flagged_ids.contains(id.as_str()))
            .count();

        if remaining_eligible == 0 {
            return RoundTally {
                participation,
                affirmative: Some(affirmative),
                flagged,
            };
        }

        // Without quorum the re-tally is dropped and the first tally stands
        let retallied_participation = remaining_votes.len() as f64 / remaining_eligible as f64;
        if retallied_participation < self.config.quorum_threshold {
            debug!(
                proposal_id = %proposal_id,
                round,
                participation = retallied_participation,
                "Re-tally lost quorum"
            );
            return RoundTally {
                participation,
                affirmative: Some(affirmative),
                flagged,
            };
        }

        let affirmative = weighted_affirmative(&remaining_votes);
        debug!(
            proposal_id = %proposal_id,
            round,
            participation = retallied_participation,
            affirmative,
            "Round re-tallied"
        );
        RoundTally {
            participation: retallied_participation,
            affirmative: Some(affirmative),
            flagged,
        }
    }

    async fn record_faults(&self, proposal_id: &str, round: u32, flagged: &[(NodeId, FaultKind)]) {
        let now = Utc::now();
        let mut faults = self.faults.write().await;
        for (node_id, kind) in flagged {
            warn!(proposal_id = %proposal_id, round, node_id = %node_id, kind = ?kind, "Byzantine fault detected");
            faults.push(FaultRecord {
                node_id: node_id.clone(),
                proposal_id: proposal_id.to_string(),
                round,
                kind: *kind,
                detected_at: now,
            });
        }
        drop(faults);

        self.metrics.write().await.faults += flagged.len() as u64;
    }

    async fn record_round(
        &self,
        proposal_id: &str,
        votes: Vec<Vote>,
        summary: RoundSummary,
        eligible: &[NodeId],
    ) {
        let mut proposals = self.proposals.write().await;
        if let Some(proposal) = proposals.get_mut(proposal_id) {
            proposal.round = summary.round;
            proposal.votes.extend(votes);
            proposal.rounds.push(summary);
            proposal.eligible = eligible.to_vec();
        }
    }

    /// Apply reputation changes for a terminal proposal and close its ledger.
    async fn resolve(
        &self,
        proposal_id: &str,
        status: ProposalStatus,
        flagged: &HashMap<NodeId, FaultKind>,
    ) {
        let latest_votes: HashMap<NodeId, f64> = {
            let mut proposals = self.proposals.write().await;
            let Some(proposal) = proposals.get_mut(proposal_id) else {
                return;
            };
            proposal.status = status;
            proposal.flagged = flagged.clone();
            proposal.resolved_at = Some(Utc::now());
            proposal
                .votes
                .iter()
                .map(|v| (v.node_id.clone(), v.value))
                .collect()
        };

        let mut quarantined = Vec::new();
        {
            let mut registry = self.registry.write().await;
            for (node_id, value) in &latest_votes {
                let Some(node) = registry.nodes.get_mut(node_id) else {
                    continue;
                };

                let fault = flagged.get(node_id).copied();
                if fault.is_some() {
                    node.penalize(self.config.reputation_penalty);
                } else if matches_decision(status, *value) {
                    node.reward(self.config.reputation_gain);
                }

                let suspicious = node.record_participation(
                    fault.is_some(),
                    self.config.fault_history_window,
                    self.config.persistent_fault_limit,
                );
                let fresh = node.refresh_quarantine(self.config.quarantine_threshold);
                if suspicious {
                    quarantined.push((node_id.clone(), node.reputation, Some(FaultKind::HistoricalPattern)));
                } else if fresh {
                    quarantined.push((node_id.clone(), node.reputation, fault));
                }
            }
        }

        for (node_id, reputation, reason) in quarantined {
            warn!(node_id = %node_id, reputation, reason = ?reason, "Node quarantined");
            self.events.publish(HiveEvent::NodeQuarantined {
                node_id,
                reputation,
                reason,
            });
        }
    }
}

/// Whether a vote agreed with the final decision. Timed-out proposals have no
/// direction.
fn matches_decision(status: ProposalStatus, value: f64) -> bool {
    match status {
        ProposalStatus::Approved => value >= 0.5,
        ProposalStatus::Rejected => value < 0.5,
        ProposalStatus::TimedOut | ProposalStatus::Pending => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedVoter;
    use std::time::Duration;

    fn engine(config: ConsensusConfig) -> ConsensusEngine {
        ConsensusEngine::new(config, EventBus::default(), Lifecycle::new())
    }

    async fn register(engine: &ConsensusEngine, id: &str, reputation: f64, voter: ScriptedVoter) {
        engine
            .register_node_with_reputation(id, reputation, Arc::new(voter))
            .await
            .unwrap();
    }

    fn ids(n: usize) -> Vec<NodeId> {
        (1..=n).map(|i| format!("node-{i}")).collect()
    }

    #[test]
    fn test_weighted_affirmative() {
        let vote = |value: f64, weight: f64| Vote {
            node_id: "n".to_string(),
            proposal_id: "p".to_string(),
            round: 1,
            value,
            weight,
            justification: Justification::new(0.8, "test"),
            cast_at: Utc::now(),
        };

        let votes = vec![vote(1.0, 0.5), vote(1.0, 0.5), vote(1.0, 0.5), vote(1.0, 0.5), vote(0.0, 0.5)];
        assert!((weighted_affirmative(&votes) - 0.8).abs() < 1e-9);
        assert_eq!(weighted_affirmative(&[]), 0.0);
    }

    #[tokio::test]
    async fn test_duplicate_node_rejected() {
        let engine = engine(ConsensusConfig::default());
        register(&engine, "node-1", 0.5, ScriptedVoter::voting(1.0, 0.8)).await;

        let err = engine
            .register_node("node-1", Arc::new(ScriptedVoter::voting(1.0, 0.8)))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::DuplicateNode(id) if id == "node-1"));
    }

    #[tokio::test]
    async fn test_insufficient_nodes() {
        let engine = engine(ConsensusConfig::default());
        register(&engine, "node-1", 0.5, ScriptedVoter::voting(1.0, 0.8)).await;
        register(&engine, "node-2", 0.1, ScriptedVoter::voting(1.0, 0.8)).await;
        register(&engine, "node-3", 0.5, ScriptedVoter::voting(1.0, 0.8)).await;

        assert!(engine.is_quarantined("node-2").await);

        let err = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(4))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HiveError::InsufficientNodes {
                required: 3,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_four_to_one_approves_in_first_round() {
        let engine = engine(ConsensusConfig::default());
        for id in ids(4) {
            register(&engine, &id, 0.5, ScriptedVoter::voting(1.0, 0.8)).await;
        }
        register(&engine, "node-5", 0.5, ScriptedVoter::voting(0.0, 0.8)).await;

        let outcome = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({"op": "x"}), &ids(5))
            .await
            .unwrap();

        assert_eq!(outcome.status, ProposalStatus::Approved);
        assert_eq!(outcome.rounds_used, 1);
        assert_eq!(outcome.participation, 1.0);
        assert!((outcome.affirmative - 0.8).abs() < 1e-9);

        for id in ids(4) {
            assert!((engine.reputation(&id).await.unwrap() - 0.55).abs() < 1e-9);
        }
        assert_eq!(engine.reputation("node-5").await, Some(0.5));

        let proposal = engine.proposal(&outcome.proposal_id).await.unwrap();
        assert_eq!(proposal.votes.len(), 5);
        assert_eq!(proposal.rounds.len(), 1);
        assert!(proposal.resolved_at.is_some());

        let metrics = engine.get_metrics().await;
        assert_eq!(metrics.total_proposals, 1);
        assert_eq!(metrics.approved, 1);
        assert_eq!(metrics.byzantine_faults_detected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_of_five_times_out_after_three_rounds() {
        let engine = engine(ConsensusConfig::default());
        register(&engine, "node-1", 0.5, ScriptedVoter::voting(1.0, 0.8)).await;
        register(&engine, "node-2", 0.5, ScriptedVoter::voting(1.0, 0.8)).await;
        for id in ["node-3", "node-4", "node-5"] {
            register(&engine, id, 0.5, ScriptedVoter::silent()).await;
        }

        let started = Instant::now();
        let outcome = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
            .await
            .unwrap();

        assert_eq!(outcome.status, ProposalStatus::TimedOut);
        assert_eq!(outcome.rounds_used, 3);
        assert!((outcome.participation - 0.4).abs() < 1e-9);
        assert!(started.elapsed() >= Duration::from_secs(90));

        let proposal = engine.proposal(&outcome.proposal_id).await.unwrap();
        assert!(proposal.rounds.iter().all(|r| !r.quorum_met));
        assert_eq!(proposal.eligible.len(), 5);

        // No direction, no reputation change.
        assert_eq!(engine.reputation("node-1").await, Some(0.5));

        let err = outcome.into_result().unwrap_err();
        assert!(matches!(err, HiveError::ConsensusTimeout(_)));
    }

    #[tokio::test]
    async fn test_outlier_is_excluded_and_round_retallied() {
        let engine = engine(ConsensusConfig::default());
        for id in ids(4) {
            register(&engine, &id, 0.5, ScriptedVoter::voting(0.8, 0.8)).await;
        }
        register(&engine, "node-5", 0.5, ScriptedVoter::voting(0.0, 0.9)).await;
        let mut rx = engine.events.subscribe();

        let outcome = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
            .await
            .unwrap();

        assert_eq!(outcome.status, ProposalStatus::Approved);
        assert_eq!(outcome.rounds_used, 1);
        assert_eq!(outcome.flagged, vec!["node-5".to_string()]);
        assert!(outcome.affirmative >= 0.67);

        // 0.5 - 0.3 sits on the threshold; the flag alone quarantines.
        assert!((engine.reputation("node-5").await.unwrap() - 0.2).abs() < 1e-9);
        assert!(engine.is_quarantined("node-5").await);
        assert!(rx.drain().iter().any(|e| matches!(
            e,
            HiveEvent::NodeQuarantined {
                node_id,
                reason: Some(FaultKind::Outlier),
                ..
            } if node_id == "node-5"
        )));

        let faults = engine.fault_log().await;
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::Outlier);
        assert_eq!(engine.get_metrics().await.byzantine_faults_detected, 1);

        let next = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
            .await
            .unwrap();
        let proposal = engine.proposal(&next.proposal_id).await.unwrap();
        assert_eq!(proposal.eligible, ids(4));
        assert!(proposal.votes.iter().all(|v| v.node_id != "node-5"));
    }

    #[tokio::test]
    async fn test_release_node_respects_reputation() {
        let config = ConsensusConfig {
            reputation_penalty: 0.4,
            ..ConsensusConfig::default()
        };
        let engine = engine(config);
        for id in ids(4) {
            register(&engine, &id, 0.5, ScriptedVoter::voting(0.8, 0.8)).await;
        }
        register(&engine, "node-5", 0.5, ScriptedVoter::voting(0.0, 0.9)).await;

        engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
            .await
            .unwrap();
        assert!(engine.node("node-5").await.unwrap().fault_hold);

        assert!(!engine.release_node("node-5").await.unwrap());
        let node = engine.node("node-5").await.unwrap();
        assert!(!node.fault_hold);
        assert!(node.quarantined);
        assert!(node.reputation < 0.2);
    }

    #[tokio::test]
    async fn test_release_unknown_node_fails() {
        let engine = engine(ConsensusConfig::default());
        assert!(matches!(
            engine.release_node("ghost").await,
            Err(HiveError::UnknownNode(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_quarantine_survives_reregistration() {
        let engine = engine(ConsensusConfig::default());
        for id in ids(4) {
            register(&engine, &id, 0.5, ScriptedVoter::voting(0.8, 0.8)).await;
        }
        register(&engine, "node-5", 0.5, ScriptedVoter::voting(0.0, 0.9)).await;
        engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
            .await
            .unwrap();
        assert!(engine.is_quarantined("node-5").await);

        engine.deregister_node("node-5").await.unwrap();
        register(&engine, "node-5", 0.9, ScriptedVoter::voting(0.8, 0.8)).await;

        let node = engine.node("node-5").await.unwrap();
        assert!(node.quarantined);
        assert!((node.reputation - 0.2).abs() < 1e-9);
        assert_eq!(node.recent_faults(), 1);

        engine.deregister_node("node-4").await.unwrap();
        register(&engine, "node-4", 0.9, ScriptedVoter::voting(0.8, 0.8)).await;
        assert_eq!(engine.reputation("node-4").await, Some(0.9));
    }

    #[tokio::test]
    async fn test_failed_retally_keeps_first_tally() {
        let engine = engine(ConsensusConfig::default());
        register(&engine, "node-1", 0.5, ScriptedVoter::voting(0.8, 0.8)).await;
        register(&engine, "node-2", 0.5, ScriptedVoter::voting(0.8, 0.8)).await;
        register(&engine, "node-3", 0.5, ScriptedVoter::voting(0.0, 0.9)).await;
        for id in ["node-4", "node-5"] {
            register(&engine, id, 0.5, ScriptedVoter::abstaining()).await;
        }

        let outcome = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
            .await
            .unwrap();
        assert_eq!(outcome.flagged, vec!["node-3".to_string()]);

        let proposal = engine.proposal(&outcome.proposal_id).await.unwrap();
        let first = &proposal.rounds[0];
        assert!(first.quorum_met);
        assert!((first.participation - 0.6).abs() < 1e-9);
        assert!((first.affirmative.unwrap() - 1.6 / 3.0).abs() < 1e-9);
        for round in &proposal.rounds {
            assert_eq!(round.quorum_met, round.participation >= 0.6);
        }
    }

    #[tokio::test]
    async fn test_split_vote_is_rejected() {
        let engine = engine(ConsensusConfig::default());
        for id in ["node-1", "node-2", "node-3"] {
            register(&engine, id, 0.5, ScriptedVoter::voting(0.6, 0.5)).await;
        }
        for id in ["node-4", "node-5"] {
            register(&engine, id, 0.5, ScriptedVoter::voting(0.2, 0.5)).await;
        }

        let outcome = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
            .await
            .unwrap();

        assert_eq!(outcome.status, ProposalStatus::Rejected);
        assert_eq!(outcome.rounds_used, 3);
        assert!(outcome.affirmative < 0.67);
        assert!((engine.reputation("node-4").await.unwrap() - 0.55).abs() < 1e-9);
        assert_eq!(engine.reputation("node-1").await, Some(0.5));
    }

    #[tokio::test]
    async fn test_repeat_outlier_quarantined_by_history() {
        let config = ConsensusConfig {
            reputation_penalty: 0.05,
            ..ConsensusConfig::default()
        };
        let engine = engine(config);
        for id in ids(4) {
            register(&engine, &id, 0.5, ScriptedVoter::voting(0.8, 0.8)).await;
        }
        register(&engine, "node-5", 0.9, ScriptedVoter::voting(0.0, 0.9)).await;

        let mut rx = engine.events.subscribe();
        for attempt in 1..=3 {
            let outcome = engine
                .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
                .await
                .unwrap();
            assert_eq!(outcome.flagged, vec!["node-5".to_string()]);
            assert!(engine.is_quarantined("node-5").await);

            // Reputation stays high, so only the history keeps it out.
            let released = engine.release_node("node-5").await.unwrap();
            assert_eq!(released, attempt < 3);
        }

        let node = engine.node("node-5").await.unwrap();
        assert!(node.quarantined);
        assert!(!node.fault_hold);
        assert!(node.persistent_suspicion);
        assert!(node.reputation >= 0.2);
        assert_eq!(node.recent_faults(), 3);

        let quarantined = rx.drain().into_iter().any(|e| {
            matches!(
                e,
                HiveEvent::NodeQuarantined {
                    ref node_id,
                    reason: Some(FaultKind::HistoricalPattern),
                    ..
                } if node_id == "node-5"
            )
        });
        assert!(quarantined);

        let outcome = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
            .await
            .unwrap();
        assert!(outcome.flagged.is_empty());
        assert_eq!(engine.proposal(&outcome.proposal_id).await.unwrap().votes.len(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_proposals() {
        let lifecycle = Lifecycle::new();
        let engine = ConsensusEngine::new(ConsensusConfig::default(), EventBus::default(), lifecycle.clone());
        for id in ids(3) {
            register(&engine, &id, 0.5, ScriptedVoter::voting(1.0, 0.8)).await;
        }

        lifecycle.shutdown(Duration::from_millis(10)).await;
        let err = engine
            .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(3))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_resolves_timed_out() {
        let lifecycle = Lifecycle::new();
        let engine = Arc::new(ConsensusEngine::new(
            ConsensusConfig::default(),
            EventBus::default(),
            lifecycle.clone(),
        ));
        for id in ids(3) {
            register(&engine, &id, 0.5, ScriptedVoter::silent()).await;
        }

        let submitter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(3))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!lifecycle.shutdown(Duration::from_millis(100)).await);

        let outcome = submitter.await.unwrap().unwrap();
        assert_eq!(outcome.status, ProposalStatus::TimedOut);
        assert_eq!(engine.get_metrics().await.timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_after_quorum_resolves_timed_out() {
        let lifecycle = Lifecycle::new();
        let engine = Arc::new(ConsensusEngine::new(
            ConsensusConfig::default(),
            EventBus::default(),
            lifecycle.clone(),
        ));
        for id in ["node-1", "node-2", "node-3"] {
            register(&engine, id, 0.5, ScriptedVoter::first_round_only(0.6, 0.5)).await;
        }
        for id in ["node-4", "node-5"] {
            register(&engine, id, 0.5, ScriptedVoter::first_round_only(0.2, 0.5)).await;
        }

        let submitter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!lifecycle.shutdown(Duration::from_millis(100)).await);

        let outcome = submitter.await.unwrap().unwrap();
        assert_eq!(outcome.status, ProposalStatus::TimedOut);
        assert_eq!(outcome.rounds_used, 2);

        let proposal = engine.proposal(&outcome.proposal_id).await.unwrap();
        assert!(proposal.rounds[0].quorum_met);

        // Round one leaned towards rejection; no side is rewarded for it.
        for id in ids(5) {
            assert_eq!(engine.reputation(&id).await, Some(0.5));
        }
        let metrics = engine.get_metrics().await;
        assert_eq!(metrics.timed_out, 1);
        assert_eq!(metrics.rejected, 0);
    }

    #[tokio::test]
    async fn test_reputation_stays_in_unit_interval() {
        let engine = engine(ConsensusConfig::default());
        for id in ids(4) {
            register(&engine, &id, 0.99, ScriptedVoter::voting(1.0, 0.8)).await;
        }

        for _ in 0..3 {
            engine
                .submit_proposal(ProposalType::Directive, serde_json::json!({}), &ids(4))
                .await
                .unwrap();
        }

        for node in engine.nodes().await {
            assert!((0.0..=1.0).contains(&node.reputation));
            assert_eq!(node.reputation, 1.0);
            assert_eq!(
                node.quarantined,
                node.reputation < 0.2 || node.persistent_suspicion || node.fault_hold
            );
        }
    }
}
