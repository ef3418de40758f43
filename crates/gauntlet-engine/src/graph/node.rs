use serde::Serialize;
use tracing::{debug, warn};

use gauntlet_core::config::{
    AggregateConfig, ConditionalConfig, NodeConfig, ProviderCallConfig, TerminalConfig, Verdict,
};
use gauntlet_core::error::{FailureCategory, GauntletError, NodeFailure};
use gauntlet_core::sanitize::InputSanitizer;
use gauntlet_core::traits::ProviderGateway;
use gauntlet_core::types::{
    NodeKind, ProviderRequest, SourceFile, StageOutcome, StageResult,
};

use super::condition::evaluate_gate;
use crate::context::WorkflowContext;
use crate::memory::WorkflowMemory;
use crate::output::{correction_instruction, parse_structured};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryState;

/// Shared services a node may use while it is invoked.
pub struct NodeEnv<'a> {
    pub gateway: &'a dyn ProviderGateway,
    pub limiter: &'a RateLimiter,
    pub memory: &'a WorkflowMemory,
    pub sanitizer: &'a InputSanitizer,
}

/// What happens after a node produced its result.
#[derive(Debug)]
pub enum Transition {
    /// Continue with the node of this id.
    Next(String),
    /// The run is over and succeeded.
    Finish,
    /// The run is over and failed.
    Fail(GauntletError),
}

/// A node in the pipeline graph.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    ProviderCall(ProviderCallConfig),
    Conditional(ConditionalConfig),
    Aggregate(AggregateConfig),
    Terminal(TerminalConfig),
}

impl From<NodeConfig> for Node {
    fn from(config: NodeConfig) -> Self {
        match config {
            NodeConfig::ProviderCall(c) => Self::ProviderCall(c),
            NodeConfig::Conditional(c) => Self::Conditional(c),
            NodeConfig::Aggregate(c) => Self::Aggregate(c),
            NodeConfig::Terminal(c) => Self::Terminal(c),
        }
    }
}

impl From<&Node> for NodeConfig {
    fn from(node: &Node) -> Self {
        match node {
            Node::ProviderCall(c) => Self::ProviderCall(c.clone()),
            Node::Conditional(c) => Self::Conditional(c.clone()),
            Node::Aggregate(c) => Self::Aggregate(c.clone()),
            Node::Terminal(c) => Self::Terminal(c.clone()),
        }
    }
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Self::ProviderCall(n) => &n.id,
            Self::Conditional(n) => &n.id,
            Self::Aggregate(n) => &n.id,
            Self::Terminal(n) => &n.id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::ProviderCall(_) => NodeKind::ProviderCall,
            Self::Conditional(_) => NodeKind::Conditional,
            Self::Aggregate(_) => NodeKind::Aggregate,
            Self::Terminal(_) => NodeKind::Terminal,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::ProviderCall(n) => Some(&n.provider),
            _ => None,
        }
    }

    /// Extra memory key the node's result is recorded under.
    pub fn memory_tag(&self) -> Option<&str> {
        match self {
            Self::ProviderCall(n) => n.memory_tag.as_deref(),
            Self::Aggregate(n) => n.memory_tag.as_deref(),
            _ => None,
        }
    }

    /// Run one attempt of this node against the context.
    pub async fn invoke(
        &self,
        env: &NodeEnv<'_>,
        ctx: &WorkflowContext,
        state: RetryState,
    ) -> Result<StageResult, NodeFailure> {
        match self {
            Self::ProviderCall(n) => invoke_provider(n, env, ctx, &state).await,
            Self::Conditional(n) => Ok(invoke_conditional(n, env, ctx)),
            Self::Aggregate(n) => Ok(invoke_aggregate(n, env, ctx)),
            Self::Terminal(n) => Ok(invoke_terminal(n)),
        }
    }

    /// Choose the next step from this node's freshly appended `result`.
    pub fn select_successor(&self, result: &StageResult) -> Transition {
        match self {
            Self::ProviderCall(n) => Transition::Next(n.next.clone()),
            Self::Aggregate(n) => Transition::Next(n.next.clone()),
            Self::Conditional(n) => match result.derived.get("branch").and_then(|b| b.as_str()) {
                Some(branch) => Transition::Next(branch.to_string()),
                None => Transition::Fail(GauntletError::LoopLimitExceeded {
                    gate: n.id.clone(),
                    max_loops: n.max_loops.unwrap_or(0),
                }),
            },
            Self::Terminal(n) => match n.verdict {
                Verdict::Succeeded => Transition::Finish,
                Verdict::Failed => Transition::Fail(GauntletError::Terminated {
                    node: n.id.clone(),
                    message: n
                        .message
                        .clone()
                        .unwrap_or_else(|| "pipeline ended with a failed verdict".into()),
                }),
            },
        }
    }
}

/// Primary input of a node: the previous work stage's output, or the changed
/// files when no work stage has run yet.
fn primary_input_is_empty(ctx: &WorkflowContext) -> bool {
    match ctx.previous_output() {
        Some(serde_json::Value::Null) | None if !ctx.has_work_stage() => ctx.input().files.is_empty(),
        Some(serde_json::Value::Null) | None => true,
        Some(serde_json::Value::Object(o)) => o.is_empty(),
        Some(serde_json::Value::Array(a)) => a.is_empty(),
        Some(serde_json::Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

async fn invoke_provider(
    node: &ProviderCallConfig,
    env: &NodeEnv<'_>,
    ctx: &WorkflowContext,
    state: &RetryState,
) -> Result<StageResult, NodeFailure> {
    if node.skip_when_empty && primary_input_is_empty(ctx) {
        debug!(node_id = %node.id, "Input empty, skipping provider call");
        return Ok(StageResult::new(&node.id, NodeKind::ProviderCall, StageOutcome::Skipped)
            .with_provider(&node.provider));
    }

    if !env.gateway.has_provider(&node.provider) {
        return Err(NodeFailure::fatal(
            FailureCategory::Configuration,
            format!("provider '{}' is not configured", node.provider),
        ));
    }

    let mut prompt = render_template(&node.prompt, ctx, env);
    let system = node
        .system
        .as_deref()
        .map(|s| render_template(s, ctx, env));

    let previous_malformed = state
        .last_failure
        .as_ref()
        .filter(|f| f.category == FailureCategory::Malformed);
    if let Some(previous) = previous_malformed {
        prompt.push_str(&correction_instruction(&previous.message, &node.required_keys));
    }

    let permit = env.limiter.admit(&node.provider).await;
    debug!(
        node_id = %node.id,
        provider = %node.provider,
        attempt = state.attempt,
        waited_ms = permit.waited.as_millis() as u64,
        "Calling provider"
    );

    let request = ProviderRequest {
        stage_id: node.id.clone(),
        system,
        prompt,
        expect_json: true,
    };
    let response = env
        .gateway
        .call(&node.provider, request)
        .await
        .map_err(NodeFailure::from)?;

    match parse_structured(&response.text, &node.required_keys) {
        Ok(derived) => Ok(
            StageResult::new(&node.id, NodeKind::ProviderCall, StageOutcome::Success)
                .with_provider(&node.provider)
                .with_raw(response.text)
                .with_derived(derived),
        ),
        // A second malformed reply in a row is not going to get better.
        Err(problem) if previous_malformed.is_some() => {
            warn!(node_id = %node.id, problem = %problem, "Output still malformed after correction");
            Err(NodeFailure::fatal(FailureCategory::Malformed, problem))
        }
        Err(problem) => {
            warn!(node_id = %node.id, problem = %problem, "Malformed provider output");
            Err(NodeFailure::retryable(FailureCategory::Malformed, problem))
        }
    }
}

fn invoke_conditional(node: &ConditionalConfig, env: &NodeEnv<'_>, ctx: &WorkflowContext) -> StageResult {
    let eval = evaluate_gate(&node.condition, ctx, env.memory);

    let prior_failures = ctx
        .stages()
        .iter()
        .filter(|r| r.stage_id == node.id)
        .filter(|r| r.derived.get("passed").and_then(|p| p.as_bool()) == Some(false))
        .count() as u32;

    let (branch, loops) = if eval.passed {
        (Some(node.on_pass.clone()), prior_failures)
    } else {
        let loops = prior_failures + 1;
        match node.max_loops {
            Some(max) if loops > max => {
                warn!(node_id = %node.id, loops, max_loops = max, "Gate loop budget spent");
                (node.on_exhausted.clone(), loops)
            }
            _ => (Some(node.on_fail.clone()), loops),
        }
    };

    debug!(node_id = %node.id, passed = eval.passed, score = ?eval.score, branch = ?branch, "Gate evaluated");

    let derived = serde_json::json!({
        "passed": eval.passed,
        "score": eval.score,
        "branch": branch,
        "loops": loops,
    });
    StageResult::new(&node.id, NodeKind::Conditional, StageOutcome::Success)
        .with_raw(derived.to_string())
        .with_derived(derived)
}

fn invoke_aggregate(node: &AggregateConfig, env: &NodeEnv<'_>, ctx: &WorkflowContext) -> StageResult {
    let mut merged = serde_json::Map::new();
    for source in &node.sources {
        let value = match ctx.latest(source) {
            Some(r) => r.derived.clone(),
            None => env
                .memory
                .get(source)
                .map(|v| v.derived().clone())
                .unwrap_or(serde_json::Value::Null),
        };
        merged.insert(source.clone(), value);
    }
    let derived = serde_json::Value::Object(merged);
    StageResult::new(&node.id, NodeKind::Aggregate, StageOutcome::Success)
        .with_raw(derived.to_string())
        .with_derived(derived)
}

fn invoke_terminal(node: &TerminalConfig) -> StageResult {
    let derived = serde_json::json!({
        "verdict": node.verdict,
        "message": node.message,
    });
    StageResult::new(&node.id, NodeKind::Terminal, StageOutcome::Success)
        .with_raw(derived.to_string())
        .with_derived(derived)
}

/// Render `{placeholder}`s in a prompt template.
///
/// Known placeholders: `{input}`, `{files}`, `{execution_id}`, `{project_type}`
/// and `{<stage_id>}`. Anything else, including JSON braces, is left verbatim.
pub fn render_template(template: &str, ctx: &WorkflowContext, env: &NodeEnv<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        let is_placeholder = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        match is_placeholder.then(|| resolve_placeholder(name, ctx, env)).flatten() {
            Some(value) => {
                out.push_str(&value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_placeholder(name: &str, ctx: &WorkflowContext, env: &NodeEnv<'_>) -> Option<String> {
    match name {
        "files" => Some(render_files(&ctx.input().files, env.sanitizer)),
        "execution_id" => Some(ctx.execution_id().to_string()),
        "project_type" => Some(ctx.project_type().to_string()),
        "input" => Some(match ctx.previous_output() {
            Some(v) => value_to_prompt(v),
            None => render_files(&ctx.input().files, env.sanitizer),
        }),
        stage => match ctx.latest(stage) {
            Some(r) => Some(value_to_prompt(&r.derived)),
            None => env.memory.get(stage).map(|v| value_to_prompt(v.derived())),
        },
    }
}

fn value_to_prompt(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn render_files(files: &[SourceFile], sanitizer: &InputSanitizer) -> String {
    if files.is_empty() {
        return "(no files)".to_string();
    }
    files
        .iter()
        .map(|f| {
            format!(
                "### {} ({})\n```{}\n{}\n```",
                f.path,
                f.language,
                f.language.to_lowercase(),
                sanitizer.sanitize(&f.content)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
