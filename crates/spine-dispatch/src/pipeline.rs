//! The contract a pipeline implementation provides to the dispatcher
//! (§6.1). `Pipeline::describe` is stable for a given version; `run` does
//! the actual domain work and must poll `ctx.cancellation` at its
//! suspension points so `Cancel` on a running execution has somewhere to
//! land.

use async_trait::async_trait;
use serde_json::Value;
use spine_types::{ErrorCategory, PipelineSpec, SpineId};
use tokio_util::sync::CancellationToken;

/// Everything a pipeline needs to do one run: its validated parameters, the
/// identifiers side effects must be tagged with (§3), and the token that
/// goes live when a caller cancels this execution.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: SpineId,
    pub capture_id: Option<SpineId>,
    pub params: Value,
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
}

/// The error half of a failed [`RunResult`]. `category` drives the
/// dispatcher's retry decision (§4.3 retry policy) — only `Transient`
/// schedules a retry.
#[derive(Debug, Clone)]
pub struct RunError {
    pub category: ErrorCategory,
    pub message: String,
    pub details: Option<Value>,
}

/// What a pipeline hands back from one `Run` invocation (§6.1). Invariant:
/// `error` is `Some` exactly when `status == Failed`.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub metrics: Option<Value>,
    pub rows_processed: Option<u64>,
    pub error: Option<RunError>,
}

impl RunResult {
    pub fn completed(metrics: Option<Value>, rows_processed: Option<u64>) -> Self {
        Self {
            status: RunStatus::Completed,
            metrics,
            rows_processed,
            error: None,
        }
    }

    pub fn failed(error: RunError) -> Self {
        Self {
            status: RunStatus::Failed,
            metrics: None,
            rows_processed: None,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    fn describe(&self) -> PipelineSpec;
    async fn run(&self, ctx: RunContext) -> RunResult;
}
