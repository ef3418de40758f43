pub mod context;
pub mod graph;
pub mod history;
pub mod memory;
pub mod output;
pub mod rate_limit;
pub mod retry;
pub mod run_log;

pub use context::WorkflowContext;
pub use graph::{Node, Orchestrator, OrchestratorBuilder, RunOutcome, WorkflowGraph};
pub use history::{RunHistory, RunSummary, WorkflowStats};
pub use memory::{MemoryValue, WorkflowMemory};
pub use rate_limit::{AdmissionPermit, RateLimiter};
pub use retry::{RetryOutcome, RetryPolicy, RetryState};
pub use run_log::RunLogger;
