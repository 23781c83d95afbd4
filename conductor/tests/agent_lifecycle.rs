//! End-to-end runs across the engines: generate an artifact, commit it once,
//! and record the task in the backlog.

use conductor::agents::StageRegistry;
use conductor::agents::llm::LlmStages;
use conductor::conductor::{ConductorOutcome, ConductorPipeline, ConductorRequest};
use conductor::handshake::{HandshakeOutcome, HandshakeRequest, QueueHandshake};
use conductor::io::backlog::{Backlog, BacklogStatus};
use conductor::io::config::{EngineConfig, HandshakeConfig};
use conductor::io::resume::ResumeStore;
use conductor::iterate::{IterateRequest, IterationEngine, IterationOutcome};
use conductor::test_support::{
    CountingSleeper, ScriptedGenerator, ScriptedScorer, ScriptedTestRunner, TestRepo,
};

#[test]
fn iterated_artifact_is_committed_once_and_recorded() {
    let repo = TestRepo::with_remote().expect("repo");
    let generator = ScriptedGenerator::new(["rough draft", "# Exports PRD\n"]);
    let scorer = ScriptedScorer::new([40.0, 92.0]);
    let sleeper = CountingSleeper::default();
    let engine = IterationEngine::new(
        &generator,
        &scorer,
        EngineConfig::default(),
        ResumeStore::new(repo.scratch().join("resume")),
    )
    .with_sleeper(&sleeper);

    let outcome = engine.iterate_prompt(&IterateRequest {
        correlation_id: Some("corr-e2e".to_string()),
        ..IterateRequest::new("Write a PRD for CSV exports")
    });
    let IterationOutcome::Completed { report } = &outcome else {
        panic!("expected completed, got {outcome:?}");
    };
    assert_eq!(report.iterations.len(), 2);
    assert_eq!(sleeper.count(), 1);
    let artifact = report.final_output.clone().expect("final output");

    let handshake = QueueHandshake::new(
        repo.git(),
        HandshakeConfig::default(),
        ScriptedTestRunner::green(),
    );
    let request = HandshakeRequest {
        correlation_id: Some(report.correlation_id.clone()),
        idempotency_uuid: Some("uuid-e2e".to_string()),
        ..HandshakeRequest::new(artifact, "CSV exports PRD", "prd-42")
    };
    let backlog = Backlog::new(repo.scratch().join("backlog.json"));

    let first = handshake.queue_handshake(&request).expect("first handshake");
    let HandshakeOutcome::Committed { commit_hash, .. } = &first else {
        panic!("expected committed, got {first:?}");
    };
    backlog
        .record("prd-42", "CSV exports PRD", BacklogStatus::Committed, Some(commit_hash))
        .expect("record");

    let commits = repo.commit_count().expect("count");
    let second = handshake.queue_handshake(&request).expect("second handshake");
    assert_eq!(second.status(), "skipped");
    assert_eq!(second.commit_hash(), Some(commit_hash.as_str()));
    backlog
        .record("prd-42", "CSV exports PRD", BacklogStatus::Skipped, second.commit_hash())
        .expect("record");

    assert_eq!(repo.commit_count().expect("count"), commits);
    assert_eq!(repo.stash_count().expect("stashes"), 0);
    assert_eq!(repo.read("artifacts/prd-42.md").expect("read"), "# Exports PRD\n");
    let message = repo.run_git(&["log", "-1", "--format=%B"]).expect("log");
    assert!(message.contains("Correlation-Id: corr-e2e"));

    let entries = backlog.list().expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, BacklogStatus::Skipped);
    assert_eq!(entries[0].commit_hash.as_deref(), Some(commit_hash.as_str()));
}

#[test]
fn conductor_draft_flows_into_handshake() {
    let repo = TestRepo::with_remote().expect("repo");
    let generator = ScriptedGenerator::repeating("## Plan\n- export CSV\n");
    let scorer = ScriptedScorer::repeating(88.0);
    let stages = LlmStages::new(&generator, &scorer).expect("stages");
    let pipeline = ConductorPipeline::new(StageRegistry::uniform(&stages), EngineConfig::default());

    let outcome = pipeline.conductor(&ConductorRequest {
        correlation_id: Some("corr-pipe".to_string()),
        idempotency_uuid: Some("uuid-pipe".to_string()),
        refiner_iterations: Some(2),
        ..ConductorRequest::new("Plan the CSV export feature")
    });
    let ConductorOutcome::Completed { state, stages, .. } = &outcome else {
        panic!("expected completed, got {outcome:?}");
    };
    assert_eq!(state.steps, vec!["outliner", "refiner:1", "refiner:2", "reviewer"]);
    assert_eq!(stages.len(), 4);
    assert!(!state.escalation_used);

    let draft = state.last_output().expect("draft").to_string();
    let committed = QueueHandshake::new(
        repo.git(),
        HandshakeConfig::default(),
        ScriptedTestRunner::green(),
    )
    .queue_handshake(&HandshakeRequest {
        correlation_id: Some(state.correlation_id.clone()),
        idempotency_uuid: Some(state.idempotency_uuid.clone()),
        ..HandshakeRequest::new(draft, "CSV export plan", "plan-7")
    })
    .expect("handshake");
    assert_eq!(committed.status(), "committed");
    assert_eq!(
        repo.read("artifacts/plan-7.md").expect("read"),
        "## Plan\n- export CSV\n"
    );
}

#[test]
fn failing_generator_trips_breaker_and_nothing_is_committed() {
    let repo = TestRepo::new().expect("repo");
    let generator = ScriptedGenerator::with_results(std::iter::repeat_n(
        Err("model offline".to_string()),
        10,
    ));
    let scorer = ScriptedScorer::repeating(90.0);
    let stages = LlmStages::new(&generator, &scorer).expect("stages");
    let pipeline = ConductorPipeline::new(StageRegistry::uniform(&stages), EngineConfig::default());

    let outcome = pipeline.conductor(&ConductorRequest::new("Plan the CSV export feature"));
    assert_eq!(outcome.status(), "fallback");
    assert_eq!(generator.call_count(), 3);
    assert!(outcome.state().iterations.is_empty());
    assert_eq!(repo.commit_count().expect("count"), 1);
}
