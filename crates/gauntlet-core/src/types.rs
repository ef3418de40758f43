use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::NodeFailure;

/// Unique identifier of one pipeline run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal status of a run. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final outcome of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Success,
    Failed,
    Skipped,
}

/// The four node variants of a pipeline graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    ProviderCall,
    Conditional,
    Aggregate,
    Terminal,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderCall => write!(f, "provider_call"),
            Self::Conditional => write!(f, "conditional"),
            Self::Aggregate => write!(f, "aggregate"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// A changed file handed to the pipeline as input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
    pub language: String,
}

impl SourceFile {
    /// Create a source file, detecting the language tag from the extension.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        let language = detect_language(&path).to_string();
        Self {
            path,
            content: content.into(),
            language,
        }
    }
}

/// Map a file extension to a language tag. Unknown extensions yield "Unknown".
pub fn detect_language(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "py" => "Python",
        "js" => "JavaScript",
        "ts" => "TypeScript",
        "java" => "Java",
        "cpp" | "cc" | "cxx" => "C++",
        "c" | "h" => "C",
        "cs" => "C#",
        "go" => "Go",
        "rs" => "Rust",
        "php" => "PHP",
        "rb" => "Ruby",
        "swift" => "Swift",
        "kt" => "Kotlin",
        "scala" => "Scala",
        "sh" => "Shell",
        "ps1" => "PowerShell",
        "r" => "R",
        "pl" => "Perl",
        "lua" => "Lua",
        "dart" => "Dart",
        "elm" => "Elm",
        _ => "Unknown",
    }
}

/// Caller-supplied input of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialPayload {
    #[serde(default)]
    pub files: Vec<SourceFile>,
    /// Free-form extra data (PR number, project type, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl InitialPayload {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            files,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Structured request sent to an inference provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Stage that issued the request (for logging only).
    pub stage_id: String,
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
    /// Ask the provider for a JSON object when it supports it.
    #[serde(default)]
    pub expect_json: bool,
}

/// Provider reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl ProviderResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderErrorKind {
    Transient,
    Permanent,
}

/// Error reported by a provider gateway. Only the transient/permanent split matters to the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }
}

/// One attempt of a node invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Backoff slept before this attempt started.
    pub delay_before_ms: u64,
    /// `None` when the attempt succeeded.
    #[serde(default)]
    pub failure: Option<NodeFailure>,
}

/// Record of one stage (one node visit) within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub provider: Option<String>,
    /// Raw provider text, or the serialized payload for non-provider nodes.
    #[serde(default)]
    pub raw: String,
    /// Parsed structured output.
    #[serde(default)]
    pub derived: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    pub outcome: StageOutcome,
    #[serde(default)]
    pub error: Option<String>,
}

impl StageResult {
    /// Start a result for `stage_id`; timestamps are both set to now.
    pub fn new(stage_id: impl Into<String>, kind: NodeKind, outcome: StageOutcome) -> Self {
        let now = Utc::now();
        Self {
            stage_id: stage_id.into(),
            kind,
            provider: None,
            raw: String::new(),
            derived: serde_json::Value::Null,
            started_at: now,
            ended_at: now,
            attempts: vec![],
            outcome,
            error: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = raw.into();
        self
    }

    pub fn with_derived(mut self, derived: serde_json::Value) -> Self {
        self.derived = derived;
        self
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn elapsed_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == StageOutcome::Success
    }
}

/// Events published on the [`crate::EventBus`] while runs execute.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        execution_id: ExecutionId,
        start_node: String,
    },
    StageStarted {
        execution_id: ExecutionId,
        stage_id: String,
        kind: NodeKind,
    },
    AttemptFailed {
        execution_id: ExecutionId,
        stage_id: String,
        attempt: u32,
        failure: NodeFailure,
        next_delay_ms: Option<u64>,
    },
    StageFinished {
        execution_id: ExecutionId,
        stage_id: String,
        outcome: StageOutcome,
        attempts: u32,
        elapsed_ms: u64,
    },
    RunFinished {
        execution_id: ExecutionId,
        status: RunStatus,
        stages: usize,
        elapsed_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::StageStarted { execution_id, .. }
            | Self::AttemptFailed { execution_id, .. }
            | Self::StageFinished { execution_id, .. }
            | Self::RunFinished { execution_id, .. } => execution_id,
        }
    }
}
