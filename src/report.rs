use std::fmt::Write as _;
use std::path::Path;

use gauntlet_core::types::{RunEvent, StageOutcome};
use gauntlet_engine::{RunOutcome, WorkflowStats};

/// One progress line per event, for stderr while a run is in flight.
pub fn progress_line(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::StageStarted { stage_id, kind, .. } => {
            Some(format!("  -> {stage_id} ({kind})"))
        }
        RunEvent::AttemptFailed {
            stage_id,
            attempt,
            failure,
            next_delay_ms,
            ..
        } => Some(match next_delay_ms {
            Some(ms) => format!(
                "     {stage_id}: attempt {attempt} failed ({}), retrying in {ms}ms",
                failure.category
            ),
            None => format!("     {stage_id}: attempt {attempt} failed: {failure}"),
        }),
        _ => None,
    }
}

/// Plain-text summary of a finished run.
pub fn render_summary(outcome: &RunOutcome, stats: &WorkflowStats) -> String {
    let ctx = &outcome.context;
    let mut out = String::new();
    let _ = writeln!(out, "Run {} {}", ctx.execution_id(), ctx.status());
    let _ = writeln!(
        out,
        "{} stage(s), {} file(s), {}ms",
        ctx.stages().len(),
        ctx.input().files.len(),
        ctx.elapsed_ms()
    );
    let _ = writeln!(out);

    for stage in ctx.stages() {
        let mark = match stage.outcome {
            StageOutcome::Success => "ok",
            StageOutcome::Skipped => "skip",
            StageOutcome::Failed => "FAIL",
        };
        let provider = stage
            .provider
            .as_deref()
            .map(|p| format!(" via {p}"))
            .unwrap_or_default();
        let attempts = match stage.attempt_count() {
            0 | 1 => String::new(),
            n => format!(", {n} attempts"),
        };
        let _ = writeln!(
            out,
            "  [{mark:>4}] {}{provider} ({}ms{attempts})",
            stage.stage_id,
            stage.elapsed_ms()
        );
        if let Some(error) = &stage.error {
            let _ = writeln!(out, "         {error}");
        }
    }

    if let Some(failure) = &outcome.failure {
        let _ = writeln!(out);
        let _ = writeln!(out, "Failure: {failure}");
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Runs this session: {} ({} succeeded), memory {}/{}",
        stats.executions, stats.succeeded, stats.memory_entries, stats.memory_capacity
    );
    out
}

/// Write the JSON projection of the final context.
pub fn write_json(outcome: &RunOutcome, path: &Path) -> anyhow::Result<()> {
    let json = outcome.context.to_json()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_core::error::{FailureCategory, GauntletError, NodeFailure};
    use gauntlet_core::types::{
        ExecutionId, InitialPayload, NodeKind, RunStatus, StageResult,
    };
    use gauntlet_engine::WorkflowContext;

    fn outcome() -> RunOutcome {
        let mut ctx = WorkflowContext::new(
            ExecutionId::from_str("exec-9"),
            InitialPayload::default(),
            "general",
        );
        ctx.append(
            StageResult::new("analysis", NodeKind::ProviderCall, StageOutcome::Success)
                .with_provider("gemini"),
        )
        .unwrap();
        let mut failed = StageResult::new("review", NodeKind::ProviderCall, StageOutcome::Failed);
        failed.error = Some("401 Unauthorized".into());
        ctx.append(failed).unwrap();
        ctx.finish(RunStatus::Failed, 20).unwrap();
        RunOutcome {
            context: ctx,
            failure: Some(GauntletError::StageFailed {
                stage: "review".into(),
                attempts: 1,
                category: FailureCategory::Permanent,
                message: "401 Unauthorized".into(),
            }),
        }
    }

    #[test]
    fn test_summary_lists_stages_and_failure() {
        let text = render_summary(&outcome(), &WorkflowStats::default());
        assert!(text.starts_with("Run exec-9 failed"));
        assert!(text.contains("[  ok] analysis via gemini"));
        assert!(text.contains("[FAIL] review"));
        assert!(text.contains("401 Unauthorized"));
        assert!(text.contains("Failure:"));
    }

    #[test]
    fn test_progress_lines() {
        let started = RunEvent::StageStarted {
            execution_id: ExecutionId::from_str("e"),
            stage_id: "review".into(),
            kind: NodeKind::ProviderCall,
        };
        assert_eq!(progress_line(&started).unwrap(), "  -> review (provider_call)");

        let failed = RunEvent::AttemptFailed {
            execution_id: ExecutionId::from_str("e"),
            stage_id: "review".into(),
            attempt: 1,
            failure: NodeFailure::retryable(FailureCategory::Transient, "503"),
            next_delay_ms: Some(1000),
        };
        assert!(progress_line(&failed).unwrap().contains("retrying in 1000ms"));
    }

    #[test]
    fn test_write_json_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");
        write_json(&outcome(), &path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stages"][1]["stage_id"], "review");
    }
}
