use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use gauntlet_core::event::EventBus;
use gauntlet_core::types::{ExecutionId, RunEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line for a single
/// execution. Lines already written survive a crash mid-run.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=per-stage, 3=per-attempt.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Path of the log file for `execution_id`.
    pub fn log_path(&self, execution_id: &ExecutionId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Subscribe now and write in the background until the run finishes or
    /// `cancel` fires. Subscribing before the run starts means `run_started`
    /// is never missed.
    pub fn spawn(
        self,
        event_bus: Arc<EventBus>,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(async move { self.run(rx, execution_id, cancel).await })
    }

    async fn run(self, mut rx: Receiver<RunEvent>, execution_id: ExecutionId, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&execution_id);
        let file = match open_append(&log_path).await {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.execution_id() != &execution_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if matches!(event, RunEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert a RunEvent to a log entry (None if filtered out by level).
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let entry = |event_type, stage_id: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            execution_id: event.execution_id().to_string(),
            event_type,
            stage_id: stage_id.map(String::from),
            detail,
        };

        match event {
            // L1: run summary
            RunEvent::RunStarted { start_node, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "start_node": start_node })),
            )),
            RunEvent::RunFinished {
                status,
                stages,
                elapsed_ms,
                error,
                ..
            } => Some(entry(
                "run_finished",
                None,
                Some(serde_json::json!({
                    "status": status,
                    "stages": stages,
                    "elapsed_ms": elapsed_ms,
                    "error": error,
                })),
            )),

            // L2: per stage
            RunEvent::StageStarted { stage_id, kind, .. } if self.level >= 2 => Some(entry(
                "stage_started",
                Some(stage_id.as_str()),
                Some(serde_json::json!({ "kind": kind })),
            )),
            RunEvent::StageFinished {
                stage_id,
                outcome,
                attempts,
                elapsed_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "stage_finished",
                Some(stage_id.as_str()),
                Some(serde_json::json!({
                    "outcome": outcome,
                    "attempts": attempts,
                    "elapsed_ms": elapsed_ms,
                })),
            )),

            // L3: per attempt
            RunEvent::AttemptFailed {
                stage_id,
                attempt,
                failure,
                next_delay_ms,
                ..
            } if self.level >= 3 => Some(entry(
                "attempt_failed",
                Some(stage_id.as_str()),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "category": failure.category.to_string(),
                    "message": truncate_str(&failure.message, 200),
                    "next_delay_ms": next_delay_ms,
                })),
            )),

            _ => None,
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Truncate on a char boundary at or below `max_len` bytes.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
