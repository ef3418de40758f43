use std::sync::Arc;
use std::time::Duration;

use gauntlet_core::config::{AppConfig, NodeConfig, ProviderCallConfig, TerminalConfig, Verdict};
use gauntlet_core::error::{FailureCategory, GauntletError};
use gauntlet_core::traits::ManualClock;
use gauntlet_core::types::{InitialPayload, ProviderError, RunStatus, SourceFile, StageOutcome};
use gauntlet_engine::{
    MemoryValue, Orchestrator, RateLimiter, RetryPolicy, WorkflowGraph, WorkflowMemory,
};
use gauntlet_llm::ScriptedGateway;

fn call(id: &str, next: &str) -> NodeConfig {
    NodeConfig::ProviderCall(ProviderCallConfig {
        id: id.into(),
        provider: "p".into(),
        system: None,
        prompt: format!("{id}: {{input}}"),
        required_keys: vec![],
        next: next.into(),
        skip_when_empty: false,
        memory_tag: None,
    })
}

fn terminal(id: &str) -> NodeConfig {
    NodeConfig::Terminal(TerminalConfig {
        id: id.into(),
        verdict: Verdict::Succeeded,
        message: None,
    })
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10)).with_jitter(0.0)
}

fn linear(gateway: Arc<ScriptedGateway>, memory: Arc<WorkflowMemory>) -> Orchestrator {
    let graph = WorkflowGraph::new("n1", vec![call("n1", "n2"), call("n2", "n3"), terminal("n3")])
        .unwrap();
    Orchestrator::builder(Arc::new(graph), gateway)
        .memory(memory)
        .retry(fast_retry())
        .build()
}

fn payload() -> InitialPayload {
    InitialPayload::new(vec![SourceFile::new("lib.rs", "pub fn f() {}")])
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_then_success() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .enqueue("n2", Err(ProviderError::transient("503 Service Unavailable")))
            .enqueue("n2", Err(ProviderError::transient("429 Too Many Requests"))),
    );
    let orch = linear(gateway.clone(), Arc::new(WorkflowMemory::new(10)));

    let out = orch.run("n1", payload(), None).await;

    assert_eq!(out.status(), RunStatus::Succeeded, "{:?}", out.failure);
    let stages = out.context.stages();
    assert_eq!(stages.len(), 3);
    assert_eq!(stages[1].stage_id, "n2");
    assert_eq!(stages[1].attempt_count(), 3);
    assert!(stages[1].attempts[0].failure.is_some());
    assert!(stages[1].attempts[2].failure.is_none());
    assert_eq!(stages[1].attempts[1].delay_before_ms, 10);
    assert_eq!(stages[1].attempts[2].delay_before_ms, 20);
    assert_eq!(gateway.call_count("n2"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_on_first_node() {
    let gateway = Arc::new(
        ScriptedGateway::new().enqueue("n1", Err(ProviderError::permanent("401 Unauthorized"))),
    );
    let orch = linear(gateway.clone(), Arc::new(WorkflowMemory::new(10)));

    let out = orch.run("n1", payload(), None).await;

    assert_eq!(out.status(), RunStatus::Failed);
    let stages = out.context.stages();
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].outcome, StageOutcome::Failed);
    assert_eq!(stages[0].attempt_count(), 1);
    assert!(matches!(
        out.failure,
        Some(GauntletError::StageFailed { ref stage, category: FailureCategory::Permanent, .. }) if stage == "n1"
    ));
    assert_eq!(gateway.call_count("n2"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_shorter_than_first_node() {
    let gateway = Arc::new(ScriptedGateway::new().latency("n1", Duration::from_secs(5)));
    let memory = Arc::new(WorkflowMemory::new(10));
    let orch = linear(gateway, memory.clone());

    let out = orch.run("n1", payload(), Some(Duration::from_secs(1))).await;

    assert_eq!(out.status(), RunStatus::Cancelled);
    assert!(out.context.stages().is_empty());
    assert!(matches!(out.failure, Some(GauntletError::DeadlineExceeded { .. })));
    assert!(memory.peek("n1").is_none());
    assert!(out.context.is_frozen());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_backoff_cancels() {
    let gateway = Arc::new(
        ScriptedGateway::new().enqueue("n1", Err(ProviderError::transient("503"))),
    );
    let graph = WorkflowGraph::new("n1", vec![call("n1", "end"), terminal("end")]).unwrap();
    let orch = Orchestrator::builder(Arc::new(graph), gateway.clone())
        .retry(RetryPolicy::new(3, Duration::from_secs(10)).with_jitter(0.0))
        .build();

    let out = orch.run("n1", payload(), Some(Duration::from_secs(2))).await;

    assert_eq!(out.status(), RunStatus::Cancelled);
    assert!(out.context.stages().is_empty());
    assert_eq!(gateway.call_count("n1"), 1);
    assert!(!out.context.errors().is_empty());
}

#[test]
fn test_memory_evicts_least_recently_used() {
    let clock = Arc::new(ManualClock::default());
    let memory = WorkflowMemory::with_clock(2, clock.clone());

    memory.record("a", MemoryValue::Payload(serde_json::json!(1)));
    clock.advance(Duration::from_secs(1));
    memory.record("b", MemoryValue::Payload(serde_json::json!(2)));
    clock.advance(Duration::from_secs(1));
    assert!(memory.get("a").is_some());
    clock.advance(Duration::from_secs(1));
    let evicted = memory.record("c", MemoryValue::Payload(serde_json::json!(3)));

    assert_eq!(evicted.as_deref(), Some("b"));
    assert_eq!(memory.size(), 2);
    assert!(memory.peek("a").is_some());
    assert!(memory.peek("b").is_none());
    assert!(memory.peek("c").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_shared_memory_is_bounded_across_stages() {
    let memory = Arc::new(WorkflowMemory::new(2));
    let orch = linear(Arc::new(ScriptedGateway::new()), memory.clone());

    let out = orch.run("n1", payload(), None).await;

    assert!(out.succeeded());
    assert_eq!(memory.size(), 2);
    assert!(memory.peek("n1").is_none());
    assert!(memory.peek("n3").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_calls_to_one_provider() {
    let graph = WorkflowGraph::new("n1", vec![call("n1", "n2"), call("n2", "end"), terminal("end")])
        .unwrap();
    let limiter = Arc::new(RateLimiter::unlimited().with_quota("p", 1, Duration::from_secs(10)));
    let orch = Orchestrator::builder(Arc::new(graph), Arc::new(ScriptedGateway::new()))
        .limiter(limiter)
        .retry(fast_retry())
        .build();

    let started = tokio::time::Instant::now();
    let out = orch.run("n1", payload(), None).await;

    assert!(out.succeeded());
    assert!(started.elapsed() >= Duration::from_secs(10));
}

fn demo_orchestrator(gateway: ScriptedGateway) -> Orchestrator {
    let config = AppConfig::builtin();
    Orchestrator::from_config(&config, Arc::new(gateway), Arc::new(WorkflowMemory::new(100)))
        .unwrap()
        .retry(fast_retry())
        .build()
}

fn stage_ids(out: &gauntlet_engine::RunOutcome) -> Vec<&str> {
    out.context
        .stages()
        .iter()
        .map(|s| s.stage_id.as_str())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_default_pipeline_with_demo_replies() {
    let orch = demo_orchestrator(ScriptedGateway::demo());
    let out = orch.run("analysis", payload(), None).await;

    assert!(out.succeeded(), "{:?}", out.failure);
    assert_eq!(
        stage_ids(&out),
        [
            "analysis",
            "analysis_gate",
            "enhancement",
            "review",
            "review_gate",
            "verification",
            "report",
            "done"
        ]
    );
    let report = out.context.latest("report").unwrap();
    assert_eq!(report.derived["review"]["score"], 8);
    assert_eq!(report.derived["verification"]["verdict"], "approved");
    assert!(orch.memory().peek("last_verification").is_some());

    let stats = orch.stats();
    assert_eq!(stats.nodes, 8);
    assert_eq!(stats.executions, 1);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_low_review_score_loops_back_to_enhancement() {
    let gateway = ScriptedGateway::demo().enqueue(
        "review",
        Ok(r#"{"score": 3, "notes": "Misses the empty-list case."}"#.into()),
    );
    let orch = demo_orchestrator(gateway);
    let out = orch.run("analysis", payload(), None).await;

    assert!(out.succeeded(), "{:?}", out.failure);
    let ids = stage_ids(&out);
    assert_eq!(ids.iter().filter(|id| **id == "enhancement").count(), 2);
    assert_eq!(ids.iter().filter(|id| **id == "review_gate").count(), 2);
    assert_eq!(ids.last(), Some(&"done"));
}

#[tokio::test(start_paused = true)]
async fn test_review_loop_budget_routes_to_verification() {
    let gateway = ScriptedGateway::demo().respond("review", r#"{"score": 2, "notes": "Still wrong."}"#);
    let orch = demo_orchestrator(gateway);
    let out = orch.run("analysis", payload(), None).await;

    assert!(out.succeeded(), "{:?}", out.failure);
    let ids = stage_ids(&out);
    // Two loops back, then the exhausted edge.
    assert_eq!(ids.iter().filter(|id| **id == "review").count(), 3);
    let last_gate = out.context.latest("review_gate").unwrap();
    assert_eq!(last_gate.derived["branch"], "verification");
    assert_eq!(last_gate.derived["passed"], false);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_output_gets_one_correction() {
    let gateway = ScriptedGateway::demo()
        .enqueue("enhancement", Ok("Sure! Here are my changes: none".into()));
    let gateway = Arc::new(gateway);
    let orch = Orchestrator::from_config(
        &AppConfig::builtin(),
        gateway.clone(),
        Arc::new(WorkflowMemory::new(100)),
    )
    .unwrap()
    .retry(fast_retry())
    .build();

    let out = orch.run("analysis", payload(), None).await;

    assert!(out.succeeded(), "{:?}", out.failure);
    assert_eq!(out.context.latest("enhancement").unwrap().attempt_count(), 2);
    let prompts: Vec<_> = gateway
        .calls()
        .into_iter()
        .filter(|c| c.stage_id == "enhancement")
        .map(|c| c.prompt)
        .collect();
    assert!(prompts[1].contains("could not be used"));
}

#[tokio::test(start_paused = true)]
async fn test_empty_payload_never_reaches_a_provider() {
    let gateway = Arc::new(ScriptedGateway::demo());
    let orch = Orchestrator::from_config(
        &AppConfig::builtin(),
        gateway.clone(),
        Arc::new(WorkflowMemory::new(100)),
    )
    .unwrap()
    .retry(fast_retry())
    .build();

    let out = orch.run("analysis", InitialPayload::default(), None).await;

    assert_eq!(gateway.call_count("analysis"), 0);
    assert!(gateway.calls().is_empty());
    assert!(out
        .context
        .stages()
        .iter()
        .filter(|s| s.stage_id == "analysis")
        .all(|s| s.outcome == StageOutcome::Skipped));
    assert_eq!(out.status(), RunStatus::Failed);
    assert!(matches!(
        out.failure,
        Some(GauntletError::LoopLimitExceeded { ref gate, max_loops: 3 }) if gate == "analysis_gate"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_provider_fails_without_calling() {
    let gateway = ScriptedGateway::demo().with_providers(["gemini"]);
    let gateway = Arc::new(gateway);
    let orch = Orchestrator::from_config(
        &AppConfig::builtin(),
        gateway.clone(),
        Arc::new(WorkflowMemory::new(100)),
    )
    .unwrap()
    .build();

    let out = orch.run("analysis", payload(), None).await;

    assert_eq!(out.status(), RunStatus::Failed);
    assert!(matches!(
        out.failure,
        Some(GauntletError::StageFailed { ref stage, category: FailureCategory::Configuration, .. }) if stage == "enhancement"
    ));
    assert_eq!(gateway.call_count("enhancement"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_runs_share_memory_only() {
    let memory = Arc::new(WorkflowMemory::new(50));
    let orch = Arc::new(linear(Arc::new(ScriptedGateway::new()), memory.clone()));

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run("n1", payload(), None).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in runs {
        let out = handle.await.unwrap();
        assert!(out.succeeded());
        assert_eq!(out.context.stages().len(), 3);
        ids.push(out.context.execution_id().clone());
    }
    ids.sort_by(|a, b| a.0.cmp(&b.0));
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(orch.stats().executions, 4);
}
