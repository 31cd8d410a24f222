//! Pattern aggregation: group contributions by signature, resolve conflicts,
//! and validate the resulting candidates through consensus.
//!
//! A pass takes every pending group with enough distinct contributors out of
//! the pending table, plans a [`ResolutionStrategy`] for it, and submits each
//! candidate as a `pattern_validation` proposal. Groups that cannot be
//! resolved yet go back to the pending table for the next pass.
//!
//! Passes never overlap: [`PatternAggregator::run_cycle`] holds a mutex for
//! the whole pass. The pending table itself is only write-locked while groups
//! are taken out or put back, so contributions and status reads are not
//! blocked by in-flight votes.

use crate::capability::WorkerRole;
use crate::consensus::{ConsensusEngine, ProposalStatus, ProposalType};
use crate::events::{EventBus, HiveEvent};
use crate::lifecycle::Lifecycle;
use crate::pattern::{
    PatternCandidate, PatternContribution, PatternDraft, ResolutionStrategy, ValidatedPattern,
};
use crate::types::{HiveError, ProposalId, Result, Signature, WorkerId};
use chrono::{DateTime, Utc};
use hivemind_config::AggregationConfig;
use hivemind_store::{HiveStore, Namespace, StoreExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A contribution paired with its contributor's reputation at pass time.
#[derive(Debug, Clone)]
pub struct WeightedContribution {
    pub contribution: PatternContribution,
    pub reputation: f64,
}

impl WeightedContribution {
    fn weight(&self) -> f64 {
        self.reputation * self.contribution.score
    }
}

/// How a group will be turned into candidates.
#[derive(Debug, Clone)]
pub struct ResolutionPlan {
    pub strategy: ResolutionStrategy,

    /// Max population variance across confidence and quality
    pub variance: f64,

    pub candidates: Vec<PatternCandidate>,

    /// Contributions not covered by any candidate; they stay pending
    pub held_back: Vec<PatternContribution>,
}

/// Audit entry written to the `conflict-resolutions` namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub signature: Signature,
    pub strategy: ResolutionStrategy,
    pub variance: f64,
    pub contributors: Vec<WorkerId>,
    pub candidates: Vec<CandidateOutcome>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateOutcome {
    pub variant: String,
    pub confidence: f64,

    /// `None` when the candidate never reached a terminal proposal
    pub status: Option<ProposalStatus>,

    pub proposal_id: Option<ProposalId>,
}

/// Summary of one aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct AggregationReport {
    pub groups_considered: usize,
    pub validated: Vec<ValidatedPattern>,
    pub rejected: usize,
    pub left_pending: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregatorMetrics {
    pub total_patterns: u64,
    pub validated_patterns: u64,
    pub rejected_patterns: u64,
    pub pending_groups: usize,
    pub average_contributors: f64,

    /// Validated patterns per hour, with elapsed time floored at one hour
    pub growth_rate: f64,

    pub cycles_run: u64,
}

#[derive(Debug, Default)]
struct MetricsState {
    total: u64,
    validated: u64,
    rejected: u64,
    contributors: u64,
    cycles: u64,
}

/// Population variance, `0.0` for fewer than two values.
fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Weighted average of `members`, weight = reputation × score. The actions
/// come from the heaviest member; ties go to the earliest in `members`.
fn merge(
    signature: &Signature,
    members: &[&WeightedContribution],
    strategy: ResolutionStrategy,
) -> Option<PatternCandidate> {
    let first = members.first()?;

    let mut weights: Vec<f64> = members.iter().map(|m| m.weight()).collect();
    if weights.iter().sum::<f64>() <= 0.0 {
        weights = vec![1.0; members.len()];
    }
    let total: f64 = weights.iter().sum();

    let confidence = members
        .iter()
        .zip(&weights)
        .map(|(m, w)| m.contribution.draft.confidence * w)
        .sum::<f64>()
        / total;
    let quality = members
        .iter()
        .zip(&weights)
        .map(|(m, w)| m.contribution.draft.quality * w)
        .sum::<f64>()
        / total;

    let mut heaviest = (*first, weights[0]);
    for (member, weight) in members.iter().zip(&weights).skip(1) {
        if *weight > heaviest.1 {
            heaviest = (*member, *weight);
        }
    }

    let tags: BTreeSet<String> = members
        .iter()
        .flat_map(|m| m.contribution.draft.tags.iter().cloned())
        .collect();
    let durations: Vec<u64> = members
        .iter()
        .filter_map(|m| m.contribution.draft.avg_duration_ms)
        .collect();
    let avg_duration_ms = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<u64>() / durations.len() as u64)
    };

    let template = &heaviest.0.contribution.draft;
    Some(PatternCandidate {
        signature: signature.clone(),
        draft: PatternDraft {
            pattern_type: template.pattern_type.clone(),
            actions: template.actions.clone(),
            confidence,
            quality,
            tags: tags.into_iter().collect(),
            avg_duration_ms,
        },
        contributors: members
            .iter()
            .map(|m| m.contribution.contributor_id.clone())
            .collect(),
        strategy,
    })
}

/// Decide how to resolve one group. `group` must be sorted by contributor id
/// and hold one contribution per contributor.
pub fn plan_resolution(
    config: &AggregationConfig,
    signature: &Signature,
    group: &[WeightedContribution],
) -> ResolutionPlan {
    let confidences: Vec<f64> = group.iter().map(|w| w.contribution.draft.confidence).collect();
    let qualities: Vec<f64> = group.iter().map(|w| w.contribution.draft.quality).collect();
    let spread = variance(&confidences).max(variance(&qualities));
    let all: Vec<&WeightedContribution> = group.iter().collect();

    if spread <= config.conflict_variance_threshold {
        return ResolutionPlan {
            strategy: ResolutionStrategy::Merge,
            variance: spread,
            candidates: merge(signature, &all, ResolutionStrategy::Merge)
                .into_iter()
                .collect(),
            held_back: Vec::new(),
        };
    }

    if group.len() >= 2 {
        let mut top = &group[0];
        for member in &group[1..] {
            if member.reputation > top.reputation {
                top = member;
            }
        }
        let others = group.iter().map(|w| w.reputation).sum::<f64>() - top.reputation;
        let others_avg = others / (group.len() - 1) as f64;

        if top.reputation - others_avg > config.expert_margin {
            let mut draft = top.contribution.draft.clone();
            draft.tags = group
                .iter()
                .flat_map(|w| w.contribution.draft.tags.iter().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            return ResolutionPlan {
                strategy: ResolutionStrategy::DeferToExpert,
                variance: spread,
                candidates: vec![PatternCandidate {
                    signature: signature.clone(),
                    draft,
                    contributors: group
                        .iter()
                        .map(|w| w.contribution.contributor_id.clone())
                        .collect(),
                    strategy: ResolutionStrategy::DeferToExpert,
                }],
                held_back: Vec::new(),
            };
        }
    }

    let mut clusters: BTreeMap<String, Vec<&WeightedContribution>> = BTreeMap::new();
    for member in group {
        clusters
            .entry(member.contribution.draft.variant_key())
            .or_default()
            .push(member);
    }

    if clusters.len() >= 2 {
        let mut candidates = Vec::new();
        let mut held_back = Vec::new();
        for members in clusters.values() {
            if members.len() >= config.min_contributors {
                candidates.extend(merge(signature, members, ResolutionStrategy::CreateVariant));
            } else {
                held_back.extend(members.iter().map(|m| m.contribution.clone()));
            }
        }
        return ResolutionPlan {
            strategy: ResolutionStrategy::CreateVariant,
            variance: spread,
            candidates,
            held_back,
        };
    }

    ResolutionPlan {
        strategy: ResolutionStrategy::Vote,
        variance: spread,
        candidates: merge(signature, &all, ResolutionStrategy::Vote)
            .into_iter()
            .collect(),
        held_back: Vec::new(),
    }
}

/// Collects contributions and turns agreed ones into the collective library.
pub struct PatternAggregator {
    config: AggregationConfig,
    consensus: Arc<ConsensusEngine>,
    store: Arc<dyn HiveStore>,
    pending: RwLock<BTreeMap<Signature, Vec<PatternContribution>>>,
    library: RwLock<HashMap<Signature, Vec<ValidatedPattern>>>,
    cycle: Mutex<()>,
    metrics: RwLock<MetricsState>,
    events: EventBus,
    lifecycle: Lifecycle,
    started: Instant,
}

impl PatternAggregator {
    pub fn new(
        config: AggregationConfig,
        consensus: Arc<ConsensusEngine>,
        store: Arc<dyn HiveStore>,
        events: EventBus,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            config,
            consensus,
            store,
            pending: RwLock::new(BTreeMap::new()),
            library: RwLock::new(HashMap::new()),
            cycle: Mutex::new(()),
            metrics: RwLock::new(MetricsState::default()),
            events,
            lifecycle,
            started: Instant::now(),
        }
    }

    /// Reload validated patterns persisted by an earlier run.
    pub async fn load_library(&self) -> Result<usize> {
        let entries = self.store.list(Namespace::CollectivePatterns).await?;
        let mut loaded = 0;
        let mut library = self.library.write().await;

        for (key, _) in entries {
            match self
                .store
                .get_record::<ValidatedPattern>(Namespace::CollectivePatterns, &key)
                .await
            {
                Ok(Some(pattern)) => {
                    library.entry(pattern.signature.clone()).or_default().push(pattern);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable validated pattern"),
            }
        }

        for history in library.values_mut() {
            history.sort_by(|a, b| a.validated_at.cmp(&b.validated_at));
        }
        info!(loaded, "Loaded collective pattern library");
        Ok(loaded)
    }

    /// Queue a contribution under its signature. A contributor's newer
    /// submission for the same signature replaces the older one.
    pub async fn submit_pattern(&self, contribution: PatternContribution) -> Result<Signature> {
        if self.lifecycle.is_shutting_down() {
            return Err(HiveError::ShuttingDown);
        }
        if self.consensus.is_quarantined(&contribution.contributor_id).await {
            return Err(HiveError::QuarantinedNode(contribution.contributor_id));
        }
        contribution.draft.validate()?;

        let signature = contribution.signature();
        if let Err(e) = self
            .store
            .put_record(
                Namespace::HiveCollective,
                &contribution.id,
                &contribution,
                Some(self.config.contribution_ttl()),
            )
            .await
        {
            warn!(contribution_id = %contribution.id, error = %e, "Failed to persist contribution");
        }

        debug!(
            signature = %signature,
            contributor = %contribution.contributor_id,
            confidence = contribution.draft.confidence,
            "Pattern contribution queued"
        );

        {
            let mut pending = self.pending.write().await;
            let group = pending.entry(signature.clone()).or_default();
            group.retain(|c| c.contributor_id != contribution.contributor_id);
            group.push(contribution);
        }
        self.metrics.write().await.total += 1;

        Ok(signature)
    }

    /// Run one aggregation pass. A pass already in progress is awaited first.
    pub async fn run_cycle(&self) -> Result<AggregationReport> {
        if self.lifecycle.is_shutting_down() {
            return Err(HiveError::ShuttingDown);
        }
        let _pass = self.cycle.lock().await;
        self.lifecycle.track(self.aggregate()).await
    }

    /// Spawn the periodic aggregation loop, stopped by the lifecycle token.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let period = aggregator.config.interval();
            let token = aggregator.lifecycle.token().clone();
            let mut tick = tokio::time::interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_ms = period.as_millis() as u64, "Starting pattern aggregation loop");
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match aggregator.run_cycle().await {
                            Ok(report) => debug!(
                                validated = report.validated.len(),
                                rejected = report.rejected,
                                "Scheduled aggregation pass finished"
                            ),
                            Err(HiveError::ShuttingDown) => break,
                            Err(e) => warn!("Scheduled aggregation pass failed: {}", e),
                        }
                    }
                    _ = token.cancelled() => {
                        info!("Shutdown signal received, stopping aggregation loop");
                        break;
                    }
                }
            }
        })
    }

    async fn aggregate(&self) -> Result<AggregationReport> {
        let started = Instant::now();
        let ready: Vec<(Signature, Vec<PatternContribution>)> = {
            let mut pending = self.pending.write().await;
            let signatures: Vec<Signature> = pending
                .iter()
                .filter(|(_, group)| group.len() >= self.config.min_contributors)
                .map(|(signature, _)| signature.clone())
                .collect();
            signatures
                .into_iter()
                .filter_map(|s| pending.remove_entry(&s))
                .collect()
        };

        info!(groups = ready.len(), "Aggregation pass started");
        let mut report = AggregationReport {
            groups_considered: ready.len(),
            ..AggregationReport::default()
        };

        for (signature, contributions) in ready {
            let leftover = if self.lifecycle.token().is_cancelled() {
                contributions
            } else {
                self.resolve_group(&signature, contributions, &mut report).await
            };
            if !leftover.is_empty() {
                report.left_pending += 1;
                self.restore(signature, leftover).await;
            }
        }

        self.metrics.write().await.cycles += 1;
        info!(
            validated = report.validated.len(),
            rejected = report.rejected,
            left_pending = report.left_pending,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation pass finished"
        );
        Ok(report)
    }

    /// Put contributions back, skipping contributors who resubmitted during
    /// the pass.
    async fn restore(&self, signature: Signature, contributions: Vec<PatternContribution>) {
        let mut pending = self.pending.write().await;
        let group = pending.entry(signature).or_default();
        for contribution in contributions {
            if !group
                .iter()
                .any(|c| c.contributor_id == contribution.contributor_id)
            {
                group.push(contribution);
            }
        }
    }

    /// Resolve one group. Returns the contributions that stay pending.
    async fn resolve_group(
        &self,
        signature: &Signature,
        contributions: Vec<PatternContribution>,
        report: &mut AggregationReport,
    ) -> Vec<PatternContribution> {
        let mut group = Vec::with_capacity(contributions.len());
        for contribution in contributions {
            if self.consensus.is_quarantined(&contribution.contributor_id).await {
                debug!(
                    contributor = %contribution.contributor_id,
                    "Dropping contribution from quarantined contributor"
                );
                continue;
            }
            let reputation = self
                .consensus
                .reputation(&contribution.contributor_id)
                .await
                .unwrap_or(self.consensus.config().default_reputation);
            group.push(WeightedContribution {
                contribution,
                reputation,
            });
        }

        if group.len() < self.config.min_contributors {
            return group.into_iter().map(|w| w.contribution).collect();
        }
        group.sort_by(|a, b| {
            a.contribution
                .contributor_id
                .cmp(&b.contribution.contributor_id)
                .then_with(|| a.contribution.id.cmp(&b.contribution.id))
        });

        let plan = plan_resolution(&self.config, signature, &group);
        info!(
            signature = %signature,
            strategy = ?plan.strategy,
            variance = plan.variance,
            contributors = group.len(),
            candidates = plan.candidates.len(),
            "Resolving pattern group"
        );

        let mut leftover = plan.held_back;
        let mut outcomes = Vec::with_capacity(plan.candidates.len());

        for candidate in plan.candidates {
            let variant = candidate.draft.variant_key();
            let confidence = candidate.draft.confidence;
            match self.validate_candidate(candidate.clone()).await {
                Ok((status, proposal_id, validated)) => {
                    if let Some(pattern) = validated {
                        report.validated.push(pattern);
                    } else {
                        report.rejected += 1;
                    }
                    outcomes.push(CandidateOutcome {
                        variant,
                        confidence,
                        status: Some(status),
                        proposal_id: Some(proposal_id),
                    });
                }
                Err(e) => {
                    let unresolved = HiveError::ConflictUnresolved {
                        signature: signature.clone(),
                        reason: e.to_string(),
                    };
                    warn!(error = %unresolved, "Pattern group left pending");
                    let members: HashSet<&WorkerId> = candidate.contributors.iter().collect();
                    leftover.extend(
                        group
                            .iter()
                            .filter(|w| members.contains(&w.contribution.contributor_id))
                            .map(|w| w.contribution.clone()),
                    );
                    outcomes.push(CandidateOutcome {
                        variant,
                        confidence,
                        status: None,
                        proposal_id: None,
                    });
                }
            }
        }

        self.record_resolution(ResolutionRecord {
            signature: signature.clone(),
            strategy: plan.strategy,
            variance: plan.variance,
            contributors: group
                .iter()
                .map(|w| w.contribution.contributor_id.clone())
                .collect(),
            candidates: outcomes,
            resolved_at: Utc::now(),
        })
        .await;

        let kept: HashSet<&str> = leftover.iter().map(|c| c.id.as_str()).collect();
        for resolved in group.iter().filter(|w| !kept.contains(w.contribution.id.as_str())) {
            if let Err(e) = self
                .store
                .delete(Namespace::HiveCollective, &resolved.contribution.id)
                .await
            {
                debug!(error = %e, "Failed to drop resolved contribution");
            }
        }

        leftover
    }

    /// Submit a candidate for validation. Returns the terminal status and
    /// the stored pattern on approval.
    async fn validate_candidate(
        &self,
        candidate: PatternCandidate,
    ) -> Result<(ProposalStatus, ProposalId, Option<ValidatedPattern>)> {
        let eligible = self.voters_for(&candidate).await;
        let payload = serde_json::to_value(&candidate).map_err(anyhow::Error::from)?;
        let outcome = self
            .consensus
            .submit_proposal(ProposalType::PatternValidation, payload, &eligible)
            .await?;

        if !outcome.is_approved() {
            info!(
                signature = %candidate.signature,
                status = ?outcome.status,
                "Pattern candidate not validated"
            );
            self.metrics.write().await.rejected += 1;
            self.events.publish(HiveEvent::PatternRejected {
                signature: candidate.signature,
                status: outcome.status,
            });
            return Ok((outcome.status, outcome.proposal_id, None));
        }

        let distinct: HashSet<&WorkerId> = candidate.contributors.iter().collect();
        if distinct.len() < self.config.min_contributors {
            error!(
                signature = %candidate.signature,
                contributors = distinct.len(),
                "Approved candidate lacks contributors"
            );
            return Ok((outcome.status, outcome.proposal_id, None));
        }

        let pattern = ValidatedPattern::from_candidate(
            candidate,
            outcome.proposal_id.clone(),
            outcome.affirmative,
        );
        if let Err(e) = self
            .store
            .put_record(Namespace::CollectivePatterns, &pattern.id, &pattern, None)
            .await
        {
            warn!(pattern_id = %pattern.id, error = %e, "Failed to persist validated pattern");
        }

        self.library
            .write()
            .await
            .entry(pattern.signature.clone())
            .or_default()
            .push(pattern.clone());
        {
            let mut metrics = self.metrics.write().await;
            metrics.validated += 1;
            metrics.contributors += pattern.contributors.len() as u64;
        }

        info!(
            pattern_id = %pattern.id,
            signature = %pattern.signature,
            confidence = pattern.confidence,
            consensus_score = pattern.consensus_score,
            "Pattern validated"
        );
        self.events.publish(HiveEvent::PatternValidated {
            pattern_id: pattern.id.clone(),
            signature: pattern.signature.clone(),
            confidence: pattern.confidence,
            contributors: pattern.contributors.len(),
        });

        Ok((outcome.status, outcome.proposal_id, Some(pattern)))
    }

    /// Every eligible node votes, except under [`ResolutionStrategy::Vote`]
    /// where the contributors decide when there are enough of them.
    async fn voters_for(&self, candidate: &PatternCandidate) -> Vec<WorkerId> {
        let eligible = self.consensus.eligible_node_ids().await;
        if candidate.strategy != ResolutionStrategy::Vote {
            return eligible;
        }

        let contributors: Vec<WorkerId> = eligible
            .iter()
            .filter(|id| candidate.contributors.contains(id))
            .cloned()
            .collect();
        if contributors.len() >= self.consensus.config().min_nodes {
            contributors
        } else {
            eligible
        }
    }

    async fn record_resolution(&self, record: ResolutionRecord) {
        let key = format!("{}:{}", record.signature, uuid::Uuid::now_v7());
        if let Err(e) = self
            .store
            .put_record(Namespace::ConflictResolutions, &key, &record, None)
            .await
        {
            warn!(signature = %record.signature, error = %e, "Failed to write resolution audit");
        }
    }

    /// Best validated version of every signature.
    pub async fn library(&self) -> Vec<ValidatedPattern> {
        let library = self.library.read().await;
        let mut best: Vec<ValidatedPattern> =
            library.values().filter_map(|history| best_of(history)).collect();
        best.sort_by(|a, b| a.signature.cmp(&b.signature));
        best
    }

    /// Every validation of `signature`, oldest first.
    pub async fn validated_for(&self, signature: &str) -> Vec<ValidatedPattern> {
        self.library
            .read()
            .await
            .get(signature)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn best_for(&self, signature: &str) -> Option<ValidatedPattern> {
        self.library.read().await.get(signature).and_then(|h| best_of(h))
    }

    /// Best patterns relevant to a worker of `role` with `specializations`.
    pub async fn patterns_for(
        &self,
        role: WorkerRole,
        specializations: &[String],
    ) -> Vec<ValidatedPattern> {
        self.library()
            .await
            .into_iter()
            .filter(|p| p.pattern.applies_to(role, specializations))
            .collect()
    }

    pub async fn pending_signatures(&self) -> Vec<Signature> {
        self.pending.read().await.keys().cloned().collect()
    }

    pub async fn pending_contributions(&self, signature: &str) -> usize {
        self.pending
            .read()
            .await
            .get(signature)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn get_metrics(&self) -> AggregatorMetrics {
        let pending_groups = self.pending.read().await.len();
        let state = self.metrics.read().await;
        let average_contributors = if state.validated == 0 {
            0.0
        } else {
            state.contributors as f64 / state.validated as f64
        };
        let hours = (self.started.elapsed().as_secs_f64() / 3600.0).max(1.0);

        AggregatorMetrics {
            total_patterns: state.total,
            validated_patterns: state.validated,
            rejected_patterns: state.rejected,
            pending_groups,
            average_contributors,
            growth_rate: state.validated as f64 / hours,
            cycles_run: state.cycles,
        }
    }
}

fn best_of(history: &[ValidatedPattern]) -> Option<ValidatedPattern> {
    history
        .iter()
        .fold(None::<&ValidatedPattern>, |best, p| match best {
            Some(b) if b.confidence >= p.confidence => Some(b),
            _ => Some(p),
        })
        .cloned()
}
