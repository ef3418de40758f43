use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GauntletError, Result};

/// Top-level Gauntlet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Id of the node every run starts at.
    #[serde(default = "default_start")]
    pub start: String,
    /// Upper bound on node visits per run, loops included.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Wall-clock budget of one run. 0 = no deadline.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Exposed to prompt templates as `{project_type}`.
    #[serde(default = "default_project_type")]
    pub project_type: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            start: default_start(),
            max_steps: default_max_steps(),
            deadline_secs: default_deadline_secs(),
            project_type: default_project_type(),
        }
    }
}

fn default_start() -> String { "analysis".to_string() }
fn default_max_steps() -> usize { 32 }
fn default_deadline_secs() -> u64 { 900 }
fn default_project_type() -> String { "general".to_string() }

/// Largest accepted jitter fraction; keeps every delay within 1.2x its base.
pub const MAX_JITTER_RATIO: f64 = 0.2;

/// Retry parameters applied around every node invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound of the random jitter as a fraction of the delay, at most
    /// [`MAX_JITTER_RATIO`].
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> u64 { 1000 }
fn default_jitter_ratio() -> f64 { 0.2 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_memory_capacity(),
        }
    }
}

fn default_memory_capacity() -> usize { 100 }

/// Wire protocol spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any OpenAI-compatible chat completions endpoint (OpenAI, Gemini, DeepSeek, ...).
    #[default]
    Openai,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.1 }
fn default_timeout_secs() -> u64 { 120 }

/// Sliding-window quota: at most `max_calls` admissions in any `window_secs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 { 60 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./gauntlet-logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per stage, 3 = per attempt (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => expand_home(dir),
            None => PathBuf::from("gauntlet-logs"),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// One node of the pipeline graph, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    ProviderCall(ProviderCallConfig),
    Conditional(ConditionalConfig),
    Aggregate(AggregateConfig),
    Terminal(TerminalConfig),
}

impl NodeConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::ProviderCall(n) => &n.id,
            Self::Conditional(n) => &n.id,
            Self::Aggregate(n) => &n.id,
            Self::Terminal(n) => &n.id,
        }
    }

    /// Outgoing edges as `(label, target, bounded)`. `bounded` marks a loop edge
    /// that carries `max_loops`.
    pub fn edges(&self) -> Vec<(&'static str, &str, bool)> {
        match self {
            Self::ProviderCall(n) => vec![("next", n.next.as_str(), false)],
            Self::Aggregate(n) => vec![("next", n.next.as_str(), false)],
            Self::Conditional(n) => {
                let mut edges = vec![
                    ("on_pass", n.on_pass.as_str(), false),
                    ("on_fail", n.on_fail.as_str(), n.max_loops.is_some()),
                ];
                if let Some(ex) = &n.on_exhausted {
                    edges.push(("on_exhausted", ex.as_str(), false));
                }
                edges
            }
            Self::Terminal(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallConfig {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub system: Option<String>,
    /// Template with `{input}`, `{files}`, `{execution_id}`, `{project_type}`
    /// and `{<stage_id>}` placeholders.
    pub prompt: String,
    /// Top-level keys the parsed JSON output must contain.
    #[serde(default)]
    pub required_keys: Vec<String>,
    pub next: String,
    /// Produce a Skipped result instead of calling out when the input is empty.
    #[serde(default)]
    pub skip_when_empty: bool,
    /// Extra memory key the result is recorded under.
    #[serde(default)]
    pub memory_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalConfig {
    pub id: String,
    #[serde(default)]
    pub condition: GateCondition,
    pub on_pass: String,
    pub on_fail: String,
    /// Number of times `on_fail` may be taken in one run.
    #[serde(default)]
    pub max_loops: Option<u32>,
    /// Where to go once the loop budget is spent. None fails the run.
    #[serde(default)]
    pub on_exhausted: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    pub id: String,
    pub sources: Vec<String>,
    pub next: String,
    #[serde(default)]
    pub memory_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub id: String,
    #[serde(default)]
    pub verdict: Verdict,
    #[serde(default)]
    pub message: Option<String>,
}

/// Gate condition of a Conditional node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateCondition {
    #[default]
    Always,
    /// `key == "v"`, `key != "v"` or `key contains "v"` against stage outputs.
    Expr { expr: String },
    /// A numeric field of the source's derived output is at least `threshold`.
    ScoreAtLeast {
        source: String,
        field: String,
        threshold: f64,
    },
    /// At least `min_ratio` of `terms` occur in the source's raw payload.
    ContainsTerms {
        source: String,
        terms: Vec<String>,
        #[serde(default = "default_min_ratio")]
        min_ratio: f64,
    },
    NotEmpty { source: String },
    MemoryHit { key: String },
}

fn default_min_ratio() -> f64 { 0.5 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GauntletError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let mut config: Self =
            toml::from_str(&expanded).map_err(|e| GauntletError::Config(e.to_string()))?;
        if config.nodes.is_empty() {
            config.nodes = default_graph();
        }
        Ok(config)
    }

    /// Check graph structure, provider references and numeric ranges.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(GauntletError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=MAX_JITTER_RATIO).contains(&self.retry.jitter_ratio) {
            return Err(GauntletError::Config(format!(
                "retry.jitter_ratio must be within 0..={MAX_JITTER_RATIO}, got {}",
                self.retry.jitter_ratio
            )));
        }
        if self.memory.capacity == 0 {
            return Err(GauntletError::Config("memory.capacity must be at least 1".into()));
        }
        for (id, provider) in &self.providers {
            if let Some(rl) = provider.rate_limit {
                if rl.max_calls == 0 || rl.window_secs == 0 {
                    return Err(GauntletError::Config(format!(
                        "providers.{id}.rate_limit needs max_calls and window_secs above zero"
                    )));
                }
            }
        }
        for node in &self.nodes {
            if let NodeConfig::ProviderCall(n) = node {
                if !self.providers.contains_key(&n.provider) {
                    return Err(GauntletError::UnknownProvider(format!(
                        "{} (referenced by node '{}')",
                        n.provider, n.id
                    )));
                }
            }
        }
        validate_graph(&self.pipeline.start, &self.nodes)
    }

    /// The built-in configuration: default graph, no providers.
    pub fn builtin() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            retry: RetryConfig::default(),
            memory: MemoryConfig::default(),
            providers: BTreeMap::new(),
            nodes: default_graph(),
            log: None,
        }
    }
}

/// Check node graph invariants: unique ids, known start, resolvable successors,
/// and no cycle except through a bounded `on_fail` edge.
pub fn validate_graph(start: &str, nodes: &[NodeConfig]) -> Result<()> {
    let mut by_id: HashMap<&str, &NodeConfig> = HashMap::new();
    for node in nodes {
        if by_id.insert(node.id(), node).is_some() {
            return Err(GauntletError::InvalidGraph(format!(
                "duplicate node id '{}'",
                node.id()
            )));
        }
    }
    if !by_id.contains_key(start) {
        return Err(GauntletError::NodeNotFound(start.to_string()));
    }
    for node in nodes {
        for (label, target, _) in node.edges() {
            if !by_id.contains_key(target) {
                return Err(GauntletError::InvalidGraph(format!(
                    "node '{}' {label} points at unknown node '{target}'",
                    node.id()
                )));
            }
        }
        if let NodeConfig::Conditional(c) = node {
            if c.on_exhausted.is_some() && c.max_loops.is_none() {
                return Err(GauntletError::InvalidGraph(format!(
                    "node '{}' has on_exhausted without max_loops",
                    c.id
                )));
            }
        }
    }

    // Depth-first search over unbounded edges; a back edge is an unbounded cycle.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a NodeConfig>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(GauntletError::InvalidGraph(format!(
                    "cycle through '{id}' without a bounded retry loop"
                )))
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(node) = by_id.get(id).copied() {
            for (_, target, bounded) in node.edges() {
                if !bounded {
                    visit(target, by_id, marks)?;
                }
            }
        }
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut ids: Vec<&str> = by_id.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        visit(id, &by_id, &mut marks)?;
    }
    Ok(())
}

/// Ids of nodes reachable from `start`.
pub fn reachable_nodes<'a>(start: &'a str, nodes: &'a [NodeConfig]) -> HashSet<&'a str> {
    let by_id: HashMap<&str, &NodeConfig> = nodes.iter().map(|n| (n.id(), n)).collect();
    let mut seen = HashSet::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(node) = by_id.get(id).copied() {
            stack.extend(node.edges().into_iter().map(|(_, t, _)| t));
        }
    }
    seen
}

/// The four-stage review graph used when no `[[nodes]]` are configured:
/// analysis -> enhancement -> review -> verification, with quality gates.
pub fn default_graph() -> Vec<NodeConfig> {
    vec![
        NodeConfig::ProviderCall(ProviderCallConfig {
            id: "analysis".into(),
            provider: "gemini".into(),
            system: Some(
                "You are a senior code reviewer for {project_type} projects. \
                 Reply with a single JSON object."
                    .into(),
            ),
            prompt: "Analyse the following changed files. Report the issues you find, \
                     your recommendations and an overall analysis.\n\n{files}\n\n\
                     Respond as JSON with keys \"analysis\", \"issues\" and \"recommendations\"."
                .into(),
            required_keys: vec!["analysis".into(), "issues".into(), "recommendations".into()],
            next: "analysis_gate".into(),
            skip_when_empty: true,
            memory_tag: None,
        }),
        NodeConfig::Conditional(ConditionalConfig {
            id: "analysis_gate".into(),
            condition: GateCondition::ContainsTerms {
                source: "analysis".into(),
                terms: vec!["issues".into(), "recommendations".into(), "analysis".into()],
                min_ratio: 0.5,
            },
            on_pass: "enhancement".into(),
            on_fail: "analysis".into(),
            max_loops: Some(3),
            on_exhausted: None,
        }),
        NodeConfig::ProviderCall(ProviderCallConfig {
            id: "enhancement".into(),
            provider: "chatgpt".into(),
            system: Some("You improve code based on review findings. Reply with JSON.".into()),
            prompt: "Review findings:\n{analysis}\n\nOriginal files:\n{files}\n\n\
                     Propose concrete code changes as JSON with keys \"changes\" and \"summary\"."
                .into(),
            required_keys: vec!["changes".into(), "summary".into()],
            next: "review".into(),
            skip_when_empty: false,
            memory_tag: None,
        }),
        NodeConfig::ProviderCall(ProviderCallConfig {
            id: "review".into(),
            provider: "claude".into(),
            system: Some("You check proposed changes for correctness. Reply with JSON.".into()),
            prompt: "Proposed changes:\n{input}\n\nOriginal files:\n{files}\n\n\
                     Rate the changes as JSON with keys \"score\" (0-10) and \"notes\"."
                .into(),
            required_keys: vec!["score".into(), "notes".into()],
            next: "review_gate".into(),
            skip_when_empty: false,
            memory_tag: None,
        }),
        NodeConfig::Conditional(ConditionalConfig {
            id: "review_gate".into(),
            condition: GateCondition::ScoreAtLeast {
                source: "review".into(),
                field: "score".into(),
                threshold: 6.0,
            },
            on_pass: "verification".into(),
            on_fail: "enhancement".into(),
            max_loops: Some(2),
            on_exhausted: Some("verification".into()),
        }),
        NodeConfig::ProviderCall(ProviderCallConfig {
            id: "verification".into(),
            provider: "deepseek".into(),
            system: Some("You are the final verifier of a code review. Reply with JSON.".into()),
            prompt: "Analysis:\n{analysis}\n\nChanges:\n{enhancement}\n\nReview:\n{review}\n\n\
                     Give a final verdict as JSON with keys \"verdict\" and \"summary\"."
                .into(),
            required_keys: vec!["verdict".into(), "summary".into()],
            next: "report".into(),
            skip_when_empty: false,
            memory_tag: Some("last_verification".into()),
        }),
        NodeConfig::Aggregate(AggregateConfig {
            id: "report".into(),
            sources: vec![
                "analysis".into(),
                "enhancement".into(),
                "review".into(),
                "verification".into(),
            ],
            next: "done".into(),
            memory_tag: None,
        }),
        NodeConfig::Terminal(TerminalConfig {
            id: "done".into(),
            verdict: Verdict::Succeeded,
            message: None,
        }),
    ]
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(model: &str) -> ProviderConfig {
        ProviderConfig {
            kind: ProviderKind::Openai,
            model_id: model.into(),
            api_key: None,
            base_url: None,
            max_tokens: 1024,
            temperature: 0.0,
            timeout_secs: 30,
            rate_limit: None,
        }
    }

    fn builtin_with_providers() -> AppConfig {
        let mut config = AppConfig::builtin();
        for id in ["gemini", "chatgpt", "claude", "deepseek"] {
            config.providers.insert(id.into(), provider("m"));
        }
        config
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_GAUNTLET_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_GAUNTLET_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_GAUNTLET_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_GAUNTLET_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_GAUNTLET_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.pipeline.start, "analysis");
        assert_eq!(config.pipeline.max_steps, 32);
        assert_eq!(config.pipeline.project_type, "general");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert!((config.retry.jitter_ratio - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.memory.capacity, 100);
        assert_eq!(config.nodes.len(), default_graph().len());
        assert!(config.log.is_none());
    }

    #[test]
    fn test_nodes_tagged_by_kind() {
        let toml_str = r#"
[pipeline]
start = "scan"

[providers.local]
model_id = "llama3"
base_url = "http://localhost:11434/v1"

[providers.local.rate_limit]
max_calls = 5
window_secs = 10

[[nodes]]
kind = "provider_call"
id = "scan"
provider = "local"
prompt = "Scan {files}"
required_keys = ["findings"]
next = "gate"

[[nodes]]
kind = "conditional"
id = "gate"
condition = { type = "not_empty", source = "scan" }
on_pass = "done"
on_fail = "scan"
max_loops = 2

[[nodes]]
kind = "terminal"
id = "done"
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.nodes.len(), 3);
        assert!(matches!(config.nodes[0], NodeConfig::ProviderCall(_)));
        let NodeConfig::Conditional(gate) = &config.nodes[1] else {
            panic!("expected conditional");
        };
        assert_eq!(gate.max_loops, Some(2));
        assert!(matches!(gate.condition, GateCondition::NotEmpty { .. }));
        let rl = config.providers["local"].rate_limit.unwrap();
        assert_eq!(rl.max_calls, 5);
        assert_eq!(rl.window_secs, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_graph_validates() {
        builtin_with_providers().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_provider() {
        let config = AppConfig::builtin();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GauntletError::UnknownProvider(_)));
    }

    #[test]
    fn test_validate_rejects_unbounded_cycle() {
        let nodes = vec![
            NodeConfig::Aggregate(AggregateConfig {
                id: "a".into(),
                sources: vec![],
                next: "b".into(),
                memory_tag: None,
            }),
            NodeConfig::Aggregate(AggregateConfig {
                id: "b".into(),
                sources: vec![],
                next: "a".into(),
                memory_tag: None,
            }),
        ];
        let err = validate_graph("a", &nodes).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_allows_bounded_loop_only() {
        let gate = |max_loops| {
            NodeConfig::Conditional(ConditionalConfig {
                id: "gate".into(),
                condition: GateCondition::Always,
                on_pass: "done".into(),
                on_fail: "work".into(),
                max_loops,
                on_exhausted: None,
            })
        };
        let work = NodeConfig::Aggregate(AggregateConfig {
            id: "work".into(),
            sources: vec![],
            next: "gate".into(),
            memory_tag: None,
        });
        let done = NodeConfig::Terminal(TerminalConfig {
            id: "done".into(),
            verdict: Verdict::Succeeded,
            message: None,
        });

        let bounded = vec![work.clone(), gate(Some(3)), done.clone()];
        validate_graph("work", &bounded).unwrap();

        let unbounded = vec![work, gate(None), done];
        assert!(validate_graph("work", &unbounded).is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_edge_and_duplicates() {
        let nodes = vec![NodeConfig::Aggregate(AggregateConfig {
            id: "a".into(),
            sources: vec![],
            next: "nowhere".into(),
            memory_tag: None,
        })];
        assert!(matches!(
            validate_graph("a", &nodes),
            Err(GauntletError::InvalidGraph(_))
        ));

        let dup = vec![
            NodeConfig::Terminal(TerminalConfig {
                id: "x".into(),
                verdict: Verdict::Succeeded,
                message: None,
            }),
            NodeConfig::Terminal(TerminalConfig {
                id: "x".into(),
                verdict: Verdict::Failed,
                message: None,
            }),
        ];
        assert!(validate_graph("x", &dup).is_err());
        assert!(matches!(
            validate_graph("missing", &dup[..1]),
            Err(GauntletError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_numbers() {
        let mut config = builtin_with_providers();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = builtin_with_providers();
        config.retry.jitter_ratio = 1.5;
        assert!(config.validate().is_err());
        config.retry.jitter_ratio = 0.5;
        assert!(config.validate().is_err());
        config.retry.jitter_ratio = MAX_JITTER_RATIO;
        assert!(config.validate().is_ok());

        let mut config = builtin_with_providers();
        config.memory.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reachable_nodes() {
        let nodes = default_graph();
        let reachable = reachable_nodes("review", &nodes);
        assert!(reachable.contains("done"));
        assert!(reachable.contains("enhancement"));
        assert!(!reachable.contains("analysis"));
    }

    #[test]
    fn test_log_config_defaults() {
        let config = AppConfig::from_toml("[log]\n").unwrap();
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 2);
        assert_eq!(log.resolved_dir(), PathBuf::from("gauntlet-logs"));
    }
}
