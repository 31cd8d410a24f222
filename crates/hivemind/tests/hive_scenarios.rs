use hivemind::consensus::{ConsensusEngine, ProposalStatus, ProposalType};
use hivemind::events::{EventBus, HiveEvent};
use hivemind::lifecycle::Lifecycle;
use hivemind::pattern::{PatternAction, PatternContribution, PatternDraft};
use hivemind::{
    initialize_hive_mind, Collaborators, HiveConfig, HiveMind, MemoryStore, OrchestrationOptions,
    OrchestrationStrategy, WorkerRole, WorkerSpec,
};
use hivemind_collective::test_utils::{failure, FixedExtractor, RecordingPipeline, ScriptedExecutor, ScriptedVoter};
use hivemind_config::ConsensusConfig;
use std::sync::Arc;

fn draft(confidence: f64) -> PatternDraft {
    PatternDraft::new(
        "bugfix",
        vec![PatternAction::new("reproduce"), PatternAction::new("patch"), PatternAction::new("verify")],
    )
    .with_confidence(confidence)
    .with_quality(0.8)
}

async fn hive_with(collaborators: Collaborators, workers: &[&str]) -> Arc<HiveMind> {
    hivemind::telemetry::init_tracing("warn").unwrap();
    let hive = initialize_hive_mind(Arc::new(MemoryStore::new()), HiveConfig::default(), collaborators)
        .await
        .unwrap();
    for id in workers {
        hive.spawn_worker(WorkerSpec::new(*id, WorkerRole::Implementer))
            .await
            .unwrap();
    }
    hive
}

fn five_ids() -> Vec<String> {
    (1..=5).map(|i| format!("node-{i}")).collect()
}

#[tokio::test]
async fn four_of_five_affirmative_votes_approve_in_round_one() {
    let engine = ConsensusEngine::new(ConsensusConfig::default(), EventBus::default(), Lifecycle::new());
    for (i, id) in five_ids().iter().enumerate() {
        let value = if i < 4 { 1.0 } else { 0.0 };
        engine
            .register_node(id.clone(), Arc::new(ScriptedVoter::voting(value, 0.6)))
            .await
            .unwrap();
    }

    let outcome = engine
        .submit_proposal(ProposalType::Directive, serde_json::json!({"directive": "pause"}), &five_ids())
        .await
        .unwrap();

    assert_eq!(outcome.status, ProposalStatus::Approved);
    assert_eq!(outcome.rounds_used, 1);
    assert_eq!(outcome.participation, 1.0);
    assert!((outcome.affirmative - 0.8).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn two_of_five_votes_time_out_after_three_rounds() {
    let engine = ConsensusEngine::new(ConsensusConfig::default(), EventBus::default(), Lifecycle::new());
    for (i, id) in five_ids().iter().enumerate() {
        let voter = if i < 2 {
            ScriptedVoter::voting(1.0, 0.8)
        } else {
            ScriptedVoter::silent()
        };
        engine.register_node(id.clone(), Arc::new(voter)).await.unwrap();
    }

    let outcome = engine
        .submit_proposal(ProposalType::Directive, serde_json::json!({}), &five_ids())
        .await
        .unwrap();

    assert_eq!(outcome.status, ProposalStatus::TimedOut);
    assert_eq!(outcome.rounds_used, 3);
    assert!(outcome.into_result().is_err());
    assert_eq!(engine.get_metrics().await.timed_out, 1);
}

#[tokio::test]
async fn single_contribution_stays_pending_until_a_second_arrives() {
    let hive = hive_with(
        Collaborators::new(Arc::new(ScriptedExecutor::succeeding())),
        &["w-1", "w-2", "w-3"],
    )
    .await;
    let aggregator = hive.aggregator();

    let signature = aggregator
        .submit_pattern(PatternContribution::new("w-1", WorkerRole::Implementer, draft(0.9), 1.0))
        .await
        .unwrap();
    for _ in 0..2 {
        let report = aggregator.run_cycle().await.unwrap();
        assert!(report.validated.is_empty());
        assert_eq!(aggregator.pending_contributions(&signature).await, 1);
    }

    aggregator
        .submit_pattern(PatternContribution::new("w-2", WorkerRole::Implementer, draft(0.85), 1.0))
        .await
        .unwrap();
    let report = aggregator.run_cycle().await.unwrap();

    assert_eq!(report.validated.len(), 1);
    assert!(report.validated[0].contributors.len() >= 2);
    assert!(aggregator.pending_signatures().await.is_empty());
    assert_eq!(hive.get_status().await.patterns_aggregated, 1);

    hive.shutdown().await.unwrap();
}

#[tokio::test]
async fn parallel_dispatch_succeeds_on_majority() {
    let executor = ScriptedExecutor::succeeding().with_outcome("w-3", failure("compile error"));
    let hive = hive_with(Collaborators::new(Arc::new(executor)), &["w-1", "w-2", "w-3"]).await;

    let options = OrchestrationOptions::default()
        .with_strategy(OrchestrationStrategy::Parallel)
        .with_required_workers(3);
    let result = hive.orchestrate_task("fix the flaky test", options).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.dispatched.len(), 3);
    assert_eq!(result.successes(), 2);

    let health = hive.queen().health_check().await;
    assert!((health.swarm_efficiency - 2.0 / 3.0).abs() < 1e-9);

    hive.shutdown().await.unwrap();
}

#[tokio::test]
async fn learned_patterns_reach_the_collective_library() {
    let pipeline = Arc::new(RecordingPipeline::new());
    let collaborators = Collaborators::new(Arc::new(ScriptedExecutor::succeeding()))
        .with_pipeline(pipeline.clone())
        .with_extractor(Arc::new(FixedExtractor::new(draft(0.9))));
    let hive = hive_with(collaborators, &["w-1", "w-2", "w-3"]).await;
    let mut rx = hive.events().subscribe();

    let options = OrchestrationOptions::default()
        .with_strategy(OrchestrationStrategy::Parallel)
        .with_required_workers(3);
    hive.orchestrate_task("patch the parser", options).await.unwrap();
    assert_eq!(pipeline.observations().await.len(), 3);
    assert_eq!(hive.aggregator().pending_signatures().await.len(), 1);

    let score = hive.trigger_collective_learning().await.unwrap();
    assert!(score > 0.0 && score <= 1.0);

    let status = hive.get_status().await;
    assert!(status.queen_active);
    assert_eq!(status.worker_count, 3);
    assert_eq!(status.consensus_node_count, 4);
    assert_eq!(status.patterns_aggregated, 1);
    assert_eq!(status.collective_intelligence_score, score);

    let library = hive.aggregator().library().await;
    assert_eq!(library.len(), 1);
    assert_eq!(library[0].contributors.len(), 3);
    assert!((library[0].confidence - 0.9).abs() < 1e-9);

    let events = rx.drain();
    assert!(events.iter().any(|e| matches!(e, HiveEvent::PatternValidated { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, HiveEvent::TaskCompleted { success: true, .. }))
            .count(),
        3
    );

    hive.shutdown().await.unwrap();
    assert!(rx.drain().iter().any(|e| matches!(e, HiveEvent::Abdicated { .. })));
}
