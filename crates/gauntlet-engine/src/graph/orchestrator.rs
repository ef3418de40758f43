use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use gauntlet_core::config::AppConfig;
use gauntlet_core::error::{GauntletError, Result};
use gauntlet_core::event::EventBus;
use gauntlet_core::sanitize::InputSanitizer;
use gauntlet_core::traits::ProviderGateway;
use gauntlet_core::types::{
    ExecutionId, InitialPayload, RunEvent, RunStatus, StageOutcome, StageResult,
};

use super::node::{Node, NodeEnv, Transition};
use super::WorkflowGraph;
use crate::context::WorkflowContext;
use crate::history::{RunHistory, RunSummary, WorkflowStats};
use crate::memory::{MemoryValue, WorkflowMemory};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryOutcome, RetryPolicy};

/// Final context of a run plus the reason it did not succeed, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub context: WorkflowContext,
    pub failure: Option<GauntletError>,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        self.context.status()
    }

    pub fn succeeded(&self) -> bool {
        self.status() == RunStatus::Succeeded
    }
}

/// Walks a [`WorkflowGraph`], applying rate limits and retries around each node.
///
/// One orchestrator may serve many concurrent runs; they share only the
/// memory, the limiter and the run history.
pub struct Orchestrator {
    graph: Arc<WorkflowGraph>,
    gateway: Arc<dyn ProviderGateway>,
    limiter: Arc<RateLimiter>,
    memory: Arc<WorkflowMemory>,
    retry: RetryPolicy,
    events: Option<Arc<EventBus>>,
    history: Arc<RunHistory>,
    max_steps: usize,
    project_type: String,
}

pub struct OrchestratorBuilder {
    graph: Arc<WorkflowGraph>,
    gateway: Arc<dyn ProviderGateway>,
    limiter: Option<Arc<RateLimiter>>,
    memory: Option<Arc<WorkflowMemory>>,
    retry: RetryPolicy,
    events: Option<Arc<EventBus>>,
    history: Option<Arc<RunHistory>>,
    max_steps: usize,
    project_type: String,
}

impl OrchestratorBuilder {
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn memory(mut self, memory: Arc<WorkflowMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn history(mut self, history: Arc<RunHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn project_type(mut self, project_type: impl Into<String>) -> Self {
        self.project_type = project_type.into();
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            graph: self.graph,
            gateway: self.gateway,
            limiter: self.limiter.unwrap_or_else(|| Arc::new(RateLimiter::unlimited())),
            memory: self.memory.unwrap_or_else(|| Arc::new(WorkflowMemory::new(100))),
            retry: self.retry,
            events: self.events,
            history: self.history.unwrap_or_default(),
            max_steps: self.max_steps.max(1),
            project_type: self.project_type,
        }
    }
}

impl Orchestrator {
    pub fn builder(graph: Arc<WorkflowGraph>, gateway: Arc<dyn ProviderGateway>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            graph,
            gateway,
            limiter: None,
            memory: None,
            retry: RetryPolicy::default(),
            events: None,
            history: None,
            max_steps: 32,
            project_type: "general".to_string(),
        }
    }

    /// Assemble an orchestrator from configuration. `memory` is the process-wide store.
    pub fn from_config(
        config: &AppConfig,
        gateway: Arc<dyn ProviderGateway>,
        memory: Arc<WorkflowMemory>,
    ) -> Result<OrchestratorBuilder> {
        let graph = WorkflowGraph::from_config(config)?;
        Ok(Self::builder(Arc::new(graph), gateway)
            .limiter(Arc::new(RateLimiter::from_config(&config.providers)))
            .memory(memory)
            .retry(RetryPolicy::from_config(&config.retry))
            .max_steps(config.pipeline.max_steps)
            .project_type(config.pipeline.project_type.clone()))
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn memory(&self) -> &Arc<WorkflowMemory> {
        &self.memory
    }

    pub fn history(&self) -> &Arc<RunHistory> {
        &self.history
    }

    pub fn stats(&self) -> WorkflowStats {
        self.history.summarize(WorkflowStats {
            nodes: self.graph.nodes().len(),
            edges: self.graph.edge_count(),
            memory_entries: self.memory.size(),
            memory_capacity: self.memory.capacity(),
            ..WorkflowStats::default()
        })
    }

    fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Run the pipeline from `start` with a fresh execution id.
    pub async fn run(&self, start: &str, payload: InitialPayload, deadline: Option<Duration>) -> RunOutcome {
        self.run_as(ExecutionId::new(), start, payload, deadline).await
    }

    /// Run the pipeline under a caller-chosen execution id.
    pub async fn run_as(
        &self,
        execution_id: ExecutionId,
        start: &str,
        payload: InitialPayload,
        deadline: Option<Duration>,
    ) -> RunOutcome {
        let started = Instant::now();
        let deadline_at = deadline.map(|d| started + d);
        let mut ctx = WorkflowContext::new(execution_id.clone(), payload, self.project_type.clone());

        info!(execution_id = %execution_id, start_node = %start, "Pipeline run started");
        self.publish(RunEvent::RunStarted {
            execution_id: execution_id.clone(),
            start_node: start.to_string(),
        });

        let failure = self.walk(&mut ctx, start, started, deadline_at).await.err();

        let status = match &failure {
            None => RunStatus::Succeeded,
            Some(e) if e.is_cancellation() => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
        };
        if let Some(e) = &failure {
            if let Err(log_err) = ctx.record_error(e.to_string()) {
                debug!(error = %log_err, "Could not record run failure");
            }
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = ctx.finish(status, elapsed_ms) {
            error!(error = %e, "Failed to finalise workflow context");
        }

        match &failure {
            None => info!(execution_id = %execution_id, stages = ctx.stages().len(), elapsed_ms, "Pipeline run succeeded"),
            Some(e) => warn!(execution_id = %execution_id, status = %status, error = %e, elapsed_ms, "Pipeline run did not succeed"),
        }

        self.publish(RunEvent::RunFinished {
            execution_id: execution_id.clone(),
            status,
            stages: ctx.stages().len(),
            elapsed_ms,
            error: failure.as_ref().map(|e| e.to_string()),
        });
        self.history.record(RunSummary {
            execution_id,
            start_node: start.to_string(),
            status,
            steps: ctx.trace().len(),
            started_at: ctx.started_at(),
            elapsed_ms,
            failure: failure.as_ref().map(|e| e.to_string()),
        });

        RunOutcome {
            context: ctx,
            failure,
        }
    }

    /// Visit nodes until a terminal transition. `Err` carries the reason the run
    /// failed or was cancelled.
    async fn walk(
        &self,
        ctx: &mut WorkflowContext,
        start: &str,
        started: Instant,
        deadline_at: Option<Instant>,
    ) -> Result<()> {
        let deadline_passed = || deadline_at.is_some_and(|d| Instant::now() >= d);
        let cancelled = || GauntletError::DeadlineExceeded {
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        let mut current = start.to_string();
        let mut steps = 0usize;

        loop {
            if deadline_passed() {
                return Err(cancelled());
            }
            if steps >= self.max_steps {
                return Err(GauntletError::MaxStepsExceeded(self.max_steps));
            }
            let node = self.graph.require(&current)?;
            steps += 1;

            debug!(execution_id = %ctx.execution_id(), node_id = %current, kind = %node.kind(), step = steps, "Dispatching node");
            self.publish(RunEvent::StageStarted {
                execution_id: ctx.execution_id().clone(),
                stage_id: current.clone(),
                kind: node.kind(),
            });

            let outcome = self.dispatch(node, ctx, deadline_at).await;
            self.publish_attempt_failures(ctx.execution_id(), node.id(), &outcome);

            if outcome.cancelled {
                ctx.record_error(format!(
                    "stage {} abandoned after {} attempt(s): deadline exceeded",
                    node.id(),
                    outcome.attempts.len()
                ))?;
                return Err(cancelled());
            }
            if deadline_passed() {
                debug!(node_id = %current, "Node finished after the deadline, discarding its result");
                return Err(cancelled());
            }

            let attempts = outcome.attempts;
            match outcome.result {
                Ok(mut result) => {
                    stamp(&mut result, attempts);
                    self.finish_stage(ctx, &result);
                    ctx.append(result.clone())?;
                    self.remember(node, &result);

                    match node.select_successor(&result) {
                        Transition::Next(next) => current = next,
                        Transition::Finish => return Ok(()),
                        Transition::Fail(e) => return Err(e),
                    }
                }
                Err(failure) => {
                    let mut result = StageResult::new(node.id(), node.kind(), StageOutcome::Failed);
                    if let Some(provider) = node.provider() {
                        result = result.with_provider(provider);
                    }
                    result.error = Some(failure.message.clone());
                    let attempt_count = attempts.len() as u32;
                    stamp(&mut result, attempts);

                    error!(node_id = %node.id(), attempts = attempt_count, error = %failure, "Stage failed");
                    self.finish_stage(ctx, &result);
                    ctx.append(result)?;
                    return Err(GauntletError::StageFailed {
                        stage: node.id().to_string(),
                        attempts: attempt_count,
                        category: failure.category,
                        message: failure.message,
                    });
                }
            }
        }
    }

    async fn dispatch(
        &self,
        node: &Node,
        ctx: &WorkflowContext,
        deadline_at: Option<Instant>,
    ) -> RetryOutcome<StageResult> {
        let env = NodeEnv {
            gateway: self.gateway.as_ref(),
            limiter: &self.limiter,
            memory: &self.memory,
            sanitizer: InputSanitizer::shared(),
        };
        let env = &env;
        self.retry
            .execute(deadline_at, move |state| node.invoke(env, ctx, state))
            .await
    }

    fn remember(&self, node: &Node, result: &StageResult) {
        let value = MemoryValue::Stage(result.clone());
        self.memory.record(node.id(), value.clone());
        // Tag last so it is the most recently used of the pair.
        if let Some(tag) = node.memory_tag() {
            self.memory.record(tag, value);
        }
    }

    fn finish_stage(&self, ctx: &WorkflowContext, result: &StageResult) {
        self.publish(RunEvent::StageFinished {
            execution_id: ctx.execution_id().clone(),
            stage_id: result.stage_id.clone(),
            outcome: result.outcome,
            attempts: result.attempt_count(),
            elapsed_ms: result.elapsed_ms(),
        });
    }

    fn publish_attempt_failures(
        &self,
        execution_id: &ExecutionId,
        stage_id: &str,
        outcome: &RetryOutcome<StageResult>,
    ) {
        if self.events.is_none() {
            return;
        }
        for (i, record) in outcome.attempts.iter().enumerate() {
            if let Some(failure) = &record.failure {
                self.publish(RunEvent::AttemptFailed {
                    execution_id: execution_id.clone(),
                    stage_id: stage_id.to_string(),
                    attempt: record.attempt,
                    failure: failure.clone(),
                    next_delay_ms: outcome.attempts.get(i + 1).map(|next| next.delay_before_ms),
                });
            }
        }
    }
}

/// Attach the attempt history and span the result over all attempts.
fn stamp(result: &mut StageResult, attempts: Vec<gauntlet_core::types::AttemptRecord>) {
    if let (Some(first), Some(last)) = (attempts.first(), attempts.last()) {
        result.started_at = first.started_at;
        result.ended_at = last.ended_at;
    } else {
        result.ended_at = Utc::now();
    }
    result.attempts = attempts;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use gauntlet_core::config::{
        AggregateConfig, ConditionalConfig, GateCondition, NodeConfig, ProviderCallConfig,
        TerminalConfig, Verdict,
    };
    use gauntlet_core::error::FailureCategory;
    use gauntlet_core::types::{ProviderError, ProviderRequest, ProviderResponse};
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Reply = std::result::Result<String, ProviderError>;

    /// Per-stage reply queues; the last reply repeats once a queue runs dry.
    #[derive(Default)]
    struct StageGateway {
        replies: Mutex<HashMap<String, Vec<Reply>>>,
        calls: Mutex<Vec<String>>,
    }

    impl StageGateway {
        fn reply(self, stage: &str, replies: Vec<Reply>) -> Self {
            self.replies.lock().unwrap().insert(stage.to_string(), replies);
            self
        }
    }

    impl ProviderGateway for StageGateway {
        fn call(
            &self,
            _provider_id: &str,
            request: ProviderRequest,
        ) -> BoxFuture<'_, std::result::Result<ProviderResponse, ProviderError>> {
            self.calls.lock().unwrap().push(request.stage_id.clone());
            let mut replies = self.replies.lock().unwrap();
            let queue = replies.entry(request.stage_id).or_default();
            let reply = if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Ok("{}".to_string()))
            };
            Box::pin(async move { reply.map(ProviderResponse::text) })
        }
    }

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

    fn done() -> NodeConfig {
        NodeConfig::Terminal(TerminalConfig {
            id: "done".into(),
            verdict: Verdict::Succeeded,
            message: None,
        })
    }

    fn orchestrator(nodes: Vec<NodeConfig>, gateway: StageGateway) -> Orchestrator {
        let start = nodes[0].id().to_string();
        let graph = WorkflowGraph::new(start, nodes).unwrap();
        Orchestrator::builder(Arc::new(graph), Arc::new(gateway))
            .retry(RetryPolicy::new(3, Duration::from_millis(10)).with_jitter(0.0))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_run_records_every_stage() {
        let orch = orchestrator(
            vec![call("a", "b"), call("b", "done"), done()],
            StageGateway::default(),
        );
        let out = orch.run("a", InitialPayload::default(), None).await;
        assert!(out.succeeded(), "{:?}", out.failure);
        let ids: Vec<_> = out.context.stages().iter().map(|s| s.stage_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "done"]);
        assert!(out.context.is_frozen());
        assert!(orch.memory().peek("b").is_some());
        assert_eq!(orch.stats().executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_appends_failed_stage() {
        let gateway = StageGateway::default()
            .reply("b", vec![Err(ProviderError::permanent("401 Unauthorized"))]);
        let orch = orchestrator(vec![call("a", "b"), call("b", "done"), done()], gateway);
        let out = orch.run("a", InitialPayload::default(), None).await;

        assert_eq!(out.status(), RunStatus::Failed);
        let stages = out.context.stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[1].outcome, StageOutcome::Failed);
        assert_eq!(stages[1].attempt_count(), 1);
        assert!(matches!(
            out.failure,
            Some(GauntletError::StageFailed { category: FailureCategory::Permanent, .. })
        ));
        assert!(orch.memory().peek("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_run() {
        let gateway = StageGateway::default().reply("a", vec![Err(ProviderError::transient("503"))]);
        let orch = orchestrator(vec![call("a", "done"), done()], gateway);
        let out = orch.run("a", InitialPayload::default(), None).await;

        assert_eq!(out.status(), RunStatus::Failed);
        assert_eq!(out.context.stages()[0].attempt_count(), 3);
        assert!(matches!(
            out.failure,
            Some(GauntletError::StageFailed { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_loop_limit_fails_run() {
        let nodes = vec![
            call("work", "gate"),
            NodeConfig::Conditional(ConditionalConfig {
                id: "gate".into(),
                condition: GateCondition::Expr {
                    expr: r#"work.ok == "true""#.into(),
                },
                on_pass: "done".into(),
                on_fail: "work".into(),
                max_loops: Some(2),
                on_exhausted: None,
            }),
            done(),
        ];
        let gateway = StageGateway::default().reply("work", vec![Ok(r#"{"ok": false}"#.into())]);
        let orch = orchestrator(nodes, gateway);
        let out = orch.run("work", InitialPayload::default(), None).await;

        assert_eq!(out.status(), RunStatus::Failed);
        assert!(matches!(
            out.failure,
            Some(GauntletError::LoopLimitExceeded { max_loops: 2, .. })
        ));
        // work, gate, work, gate, work, gate
        assert_eq!(out.context.stages().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_passes_after_retry_loop() {
        let nodes = vec![
            call("work", "gate"),
            NodeConfig::Conditional(ConditionalConfig {
                id: "gate".into(),
                condition: GateCondition::Expr {
                    expr: r#"work.ok == "true""#.into(),
                },
                on_pass: "report".into(),
                on_fail: "work".into(),
                max_loops: Some(3),
                on_exhausted: None,
            }),
            NodeConfig::Aggregate(AggregateConfig {
                id: "report".into(),
                sources: vec!["work".into()],
                next: "done".into(),
                memory_tag: Some("last_report".into()),
            }),
            done(),
        ];
        let gateway = StageGateway::default().reply(
            "work",
            vec![Ok(r#"{"ok": false}"#.into()), Ok(r#"{"ok": true}"#.into())],
        );
        let orch = orchestrator(nodes, gateway);
        let out = orch.run("work", InitialPayload::default(), None).await;

        assert!(out.succeeded(), "{:?}", out.failure);
        assert_eq!(out.context.latest("report").unwrap().derived["work"]["ok"], true);
        assert!(orch.memory().peek("last_report").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_tag_survives_small_capacity() {
        let nodes = vec![
            call("work", "report"),
            NodeConfig::Aggregate(AggregateConfig {
                id: "report".into(),
                sources: vec!["work".into()],
                next: "done".into(),
                memory_tag: Some("last_report".into()),
            }),
            done(),
        ];
        let graph = WorkflowGraph::new("work", nodes).unwrap();
        let memory = Arc::new(WorkflowMemory::new(2));
        let orch = Orchestrator::builder(Arc::new(graph), Arc::new(StageGateway::default()))
            .memory(memory.clone())
            .build();
        let out = orch.run("work", InitialPayload::default(), None).await;

        assert!(out.succeeded(), "{:?}", out.failure);
        assert!(memory.peek("last_report").is_some());
        assert!(memory.peek("done").is_some());
        assert!(memory.peek("report").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_steps_bounds_run() {
        let graph = WorkflowGraph::new("a", vec![call("a", "b"), call("b", "done"), done()]).unwrap();
        let orch = Orchestrator::builder(Arc::new(graph), Arc::new(StageGateway::default()))
            .max_steps(2)
            .build();
        let out = orch.run("a", InitialPayload::default(), None).await;
        assert!(matches!(out.failure, Some(GauntletError::MaxStepsExceeded(2))));
        assert_eq!(out.context.stages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_start_node_fails() {
        let orch = orchestrator(vec![call("a", "done"), done()], StageGateway::default());
        let out = orch.run("missing", InitialPayload::default(), None).await;
        assert_eq!(out.status(), RunStatus::Failed);
        assert!(matches!(out.failure, Some(GauntletError::NodeNotFound(_))));
        assert!(out.context.stages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_published_in_order() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let graph = WorkflowGraph::new("a", vec![call("a", "done"), done()]).unwrap();
        let gateway = StageGateway::default().reply(
            "a",
            vec![Err(ProviderError::transient("429")), Ok("{}".into())],
        );
        let orch = Orchestrator::builder(Arc::new(graph), Arc::new(gateway))
            .retry(RetryPolicy::new(3, Duration::from_millis(5)).with_jitter(0.0))
            .events(bus.clone())
            .build();
        orch.run("a", InitialPayload::default(), None).await;

        let mut names = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            names.push(serde_json::to_value(&ev).unwrap()["event"].as_str().unwrap().to_string());
        }
        assert_eq!(
            names,
            [
                "run_started",
                "stage_started",
                "attempt_failed",
                "stage_finished",
                "stage_started",
                "stage_finished",
                "run_finished"
            ]
        );
    }
}
