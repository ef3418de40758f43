use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use gauntlet_core::types::{ExecutionId, RunStatus};

/// Summary of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub execution_id: ExecutionId,
    pub start_node: String,
    pub status: RunStatus,
    pub steps: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Aggregate statistics over the graph, the run history and memory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowStats {
    pub nodes: usize,
    pub edges: usize,
    pub executions: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub memory_entries: usize,
    pub memory_capacity: usize,
}

/// Counters over every run ever recorded, independent of the window.
#[derive(Debug, Default)]
struct Totals {
    executions: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    elapsed_ms: u64,
}

#[derive(Default)]
struct Inner {
    runs: VecDeque<RunSummary>,
    totals: Totals,
}

/// Bounded log of finished runs, newest last, plus lifetime totals.
pub struct RunHistory {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl RunHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record(&self, summary: RunSummary) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let totals = &mut inner.totals;
        totals.executions += 1;
        totals.elapsed_ms = totals.elapsed_ms.saturating_add(summary.elapsed_ms);
        match summary.status {
            RunStatus::Succeeded => totals.succeeded += 1,
            RunStatus::Failed => totals.failed += 1,
            RunStatus::Cancelled => totals.cancelled += 1,
            RunStatus::Running => {}
        }
        if inner.runs.len() >= self.capacity {
            inner.runs.pop_front();
        }
        inner.runs.push_back(summary);
    }

    /// Up to `n` most recent runs, oldest first.
    pub fn recent(&self, n: usize) -> Vec<RunSummary> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let skip = inner.runs.len().saturating_sub(n);
        inner.runs.iter().skip(skip).cloned().collect()
    }

    /// Runs currently retained in the window.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill the run-derived fields of `stats` from the lifetime totals.
    pub fn summarize(&self, mut stats: WorkflowStats) -> WorkflowStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let totals = &inner.totals;
        stats.executions = totals.executions;
        stats.succeeded = totals.succeeded;
        stats.failed = totals.failed;
        stats.cancelled = totals.cancelled;
        if totals.executions > 0 {
            stats.success_rate = totals.succeeded as f64 / totals.executions as f64;
            stats.average_duration_ms = totals.elapsed_ms as f64 / totals.executions as f64;
        }
        stats
    }
}

impl Default for RunHistory {
    fn default() -> Self {
        Self::new(100)
    }
}
