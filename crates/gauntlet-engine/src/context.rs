use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gauntlet_core::error::{GauntletError, Result};
use gauntlet_core::types::{
    ExecutionId, InitialPayload, NodeKind, RunStatus, StageOutcome, StageResult,
};

fn is_work(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::ProviderCall | NodeKind::Aggregate)
}

/// One step of the execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step: usize,
    pub node_id: String,
    pub kind: NodeKind,
    pub outcome: StageOutcome,
    pub at: DateTime<Utc>,
}

/// Append-only record threaded through one run.
///
/// Only the orchestrator mutates it; nodes get a shared reference. Once a
/// terminal status is set every mutation fails with `ContextFrozen`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    execution_id: ExecutionId,
    input: InitialPayload,
    project_type: String,
    stages: Vec<StageResult>,
    /// stage id -> latest derived output of a successful stage.
    scratch: BTreeMap<String, serde_json::Value>,
    errors: Vec<String>,
    trace: Vec<TraceEntry>,
    started_at: DateTime<Utc>,
    elapsed_ms: u64,
    status: RunStatus,
}

impl WorkflowContext {
    pub fn new(execution_id: ExecutionId, input: InitialPayload, project_type: impl Into<String>) -> Self {
        Self {
            execution_id,
            input,
            project_type: project_type.into(),
            stages: Vec::new(),
            scratch: BTreeMap::new(),
            errors: Vec::new(),
            trace: Vec::new(),
            started_at: Utc::now(),
            elapsed_ms: 0,
            status: RunStatus::Running,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn input(&self) -> &InitialPayload {
        &self.input
    }

    pub fn project_type(&self) -> &str {
        &self.project_type
    }

    /// Stage results in the order they were appended.
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Most recent result recorded for `stage_id`.
    pub fn latest(&self, stage_id: &str) -> Option<&StageResult> {
        self.stages.iter().rev().find(|r| r.stage_id == stage_id)
    }

    /// Derived output of the most recent successful work stage. Gate and
    /// terminal verdicts are not node input.
    pub fn previous_output(&self) -> Option<&serde_json::Value> {
        self.stages
            .iter()
            .rev()
            .find(|r| r.outcome == StageOutcome::Success && is_work(r.kind))
            .map(|r| &r.derived)
    }

    /// Whether any provider call or aggregate stage has been recorded.
    pub fn has_work_stage(&self) -> bool {
        self.stages.iter().any(|r| is_work(r.kind))
    }

    pub fn scratch(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.scratch
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_frozen(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_frozen() {
            return Err(GauntletError::ContextFrozen);
        }
        Ok(())
    }

    /// Append a stage result, update the scratch map and the trace.
    pub fn append(&mut self, result: StageResult) -> Result<()> {
        self.ensure_open()?;
        if result.outcome == StageOutcome::Success {
            self.scratch
                .insert(result.stage_id.clone(), result.derived.clone());
        }
        self.trace.push(TraceEntry {
            step: self.trace.len() + 1,
            node_id: result.stage_id.clone(),
            kind: result.kind,
            outcome: result.outcome,
            at: result.ended_at,
        });
        self.stages.push(result);
        Ok(())
    }

    pub fn record_error(&mut self, message: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.errors.push(message.into());
        Ok(())
    }

    /// Set the terminal status and freeze the context.
    pub fn finish(&mut self, status: RunStatus, elapsed_ms: u64) -> Result<()> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(GauntletError::Config(
                "a run can only finish with a terminal status".into(),
            ));
        }
        self.elapsed_ms = elapsed_ms;
        self.status = status;
        Ok(())
    }

    /// Serialise the whole context; stage results keep their original order.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
