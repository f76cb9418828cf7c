//! Execution backends
//!
//! A [`TaskExecutor`] is the boundary to whatever physically runs a job: a
//! local child process, a broker-backed worker pool, or a scripted stub.

mod context;
mod process;
mod stub;

use async_trait::async_trait;
use simflow_core::NodeError;

pub use context::JobContext;
pub use process::LocalProcessExecutor;
pub use stub::{StubExecutor, StubOutcome};

/// Runs a single job to completion
///
/// Implementations return the job's JSON result, or a classified error.
/// Cancellation is delivered two ways: `ctx.cancelled()` resolves, and the
/// future returned by `execute` is dropped by the pipeline. Resources held by
/// the job must therefore be released on drop (e.g. `kill_on_drop`).
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Tool names this executor accepts
    fn capabilities(&self) -> Vec<String>;

    /// Execute the job described by `ctx`
    async fn execute(&self, ctx: JobContext) -> Result<serde_json::Value, NodeError>;
}
