//! Executions ledger and dispatcher (§4.3): the state machine in
//! `pending → running → completed|failed|cancelled|dead_lettered`, entered
//! through [`submit`] and driven through [`run`], [`cancel_pending`], and
//! [`retry`].
//!
//! `run` does not own the cancellation signal for a running execution —
//! that lives with whoever is holding the worker task (typically the
//! composition root's in-flight table), since a second caller needs to be
//! able to reach it from outside `run`'s own call stack. `run` only checks
//! the token it was handed after the pipeline returns (or times out) and
//! writes `cancelled` instead of running the retry decision when it finds
//! the token already tripped.

mod decision;
mod error;
mod pipeline;

pub use decision::{decide, retry_delay, FailureOutcome};
pub use error::DispatchError;
pub use pipeline::{Pipeline, RunContext, RunError, RunResult, RunStatus};

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Map;
use spine_policy::LanePolicy;
use spine_registry::{validate, PipelineRegistry};
use spine_storage::Storage;
use spine_types::{
    DeadLetter, ErrorCategory, Execution, ExecutionEvent, ExecutionStatus, EventType, Lane, SpineError, SpineId,
    TriggerSource,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

fn new_id() -> SpineId {
    SpineId::new(Uuid::new_v4().to_string())
}

/// §4.3 `Submit`. Validates `raw_params` through the registry, returns the
/// existing execution if one is already open under the same idempotency
/// key, otherwise inserts a fresh `pending` execution and emits `created`.
#[tracing::instrument(skip(storage, registry, raw_params), fields(pipeline = %pipeline_name))]
pub async fn submit(
    storage: &Storage,
    registry: &PipelineRegistry,
    pipeline_name: &str,
    raw_params: &Map<String, serde_json::Value>,
    lane: Lane,
    trigger_source: TriggerSource,
    caller_idempotency_key: Option<String>,
) -> Result<Execution, DispatchError> {
    let call = validate(registry, pipeline_name, raw_params, caller_idempotency_key)?;

    if let Some(existing) = storage
        .find_active_by_idempotency_key(pipeline_name, &call.idempotency_key)
        .await?
    {
        info!(execution_id = %existing.id, "submit resolved to existing open execution");
        return Ok(existing);
    }

    let now = Utc::now();
    let execution = Execution {
        id: new_id(),
        pipeline: pipeline_name.to_string(),
        params: serde_json::to_value(&call.params)?,
        lane,
        trigger_source,
        status: ExecutionStatus::Pending,
        created_at: now,
        started_at: None,
        completed_at: None,
        parent_execution_id: None,
        retry_count: 0,
        idempotency_key: Some(call.idempotency_key),
        result: None,
        error: None,
        logical_key: call.concurrency_key,
    };
    storage.insert_execution(&execution).await?;
    storage
        .transition_and_log(
            &execution.id,
            None,
            &ExecutionEvent {
                execution_id: execution.id.clone(),
                timestamp: now,
                event: EventType::Created,
            },
            None,
            None,
            None,
            None,
            None,
        )
        .await?;
    info!(execution_id = %execution.id, "execution created");
    Ok(execution)
}

/// §4.3 `Retry`. Only valid from `failed`/`dead_lettered`; inserts a new
/// execution with `parent_execution_id` set and `trigger_source = retry`,
/// reusing the parent's params unless `mutated_params` overrides them.
#[tracing::instrument(skip(storage, mutated_params), fields(parent_execution_id = %parent_id))]
pub async fn retry(
    storage: &Storage,
    parent_id: &SpineId,
    mutated_params: Option<serde_json::Value>,
) -> Result<Execution, DispatchError> {
    let parent = storage.get_execution(parent_id).await?;
    if !matches!(parent.status, ExecutionStatus::Failed | ExecutionStatus::DeadLettered) {
        return Err(DispatchError::InvalidTransition {
            id: parent_id.to_string(),
            op: "retry",
        });
    }

    let now = Utc::now();
    let execution = Execution {
        id: new_id(),
        pipeline: parent.pipeline.clone(),
        params: mutated_params.unwrap_or(parent.params.clone()),
        lane: parent.lane,
        trigger_source: TriggerSource::Retry,
        status: ExecutionStatus::Pending,
        created_at: now,
        started_at: None,
        completed_at: None,
        parent_execution_id: Some(parent_id.clone()),
        retry_count: 0,
        idempotency_key: None,
        result: None,
        error: None,
        logical_key: parent.logical_key,
    };
    storage.insert_execution(&execution).await?;
    storage
        .transition_and_log(
            &execution.id,
            None,
            &ExecutionEvent {
                execution_id: execution.id.clone(),
                timestamp: now,
                event: EventType::Created,
            },
            None,
            None,
            None,
            None,
            None,
        )
        .await?;
    Ok(execution)
}

/// §4.3 `Cancel` for a `pending` execution: transitions immediately. A
/// `running` execution must be cancelled by flipping the caller's own copy
/// of its [`CancellationToken`] and letting [`run`] observe it — there is
/// no DB-only path to stop a run already in flight.
#[tracing::instrument(skip(storage), fields(execution_id = %id))]
pub async fn cancel_pending(storage: &Storage, id: &SpineId, reason: String) -> Result<Execution, DispatchError> {
    let execution = storage.get_execution(id).await?;
    if execution.status != ExecutionStatus::Pending {
        return Err(DispatchError::InvalidTransition {
            id: id.to_string(),
            op: "cancel",
        });
    }
    let now = Utc::now();
    let event = ExecutionEvent {
        execution_id: id.clone(),
        timestamp: now,
        event: EventType::Cancelled { reason },
    };
    storage
        .transition_and_log(
            id,
            Some(ExecutionStatus::Cancelled),
            &event,
            Some(now),
            None,
            None,
            None,
            None,
        )
        .await?;
    info!(event = spine_events::event_type_label(&event.event), "pending execution cancelled");
    storage.get_execution(id).await.map_err(Into::into)
}

/// §4.3 `Run`. Acquires `concurrency_lock_key` if the pipeline has one,
/// transitions `pending → running`, invokes `pipeline`, and transitions to
/// a terminal status (or back to `pending` with a `retrying` event) based
/// on the result. Safe to call concurrently for different executions; the
/// `pending`-status check plus the row update in
/// [`spine_storage::Storage::transition_and_log`] keeps two callers from
/// double-running the same one.
#[tracing::instrument(skip(storage, pipeline, policy, cancellation), fields(execution_id = %id))]
pub async fn run<P: Pipeline + ?Sized>(
    storage: &Storage,
    pipeline: &P,
    policy: &LanePolicy,
    concurrency_lock_key: Option<&str>,
    id: &SpineId,
    cancellation: CancellationToken,
) -> Result<Execution, DispatchError> {
    let execution = storage.get_execution(id).await?;
    if execution.status != ExecutionStatus::Pending {
        return Err(DispatchError::InvalidTransition {
            id: id.to_string(),
            op: "run",
        });
    }

    let guard = match concurrency_lock_key {
        Some(key) => {
            let guard = spine_lock::acquire(storage, key, id, Duration::from_millis(policy.timeout_ms)).await?;
            tracing::debug!(lock_key = key, "concurrency lock acquired");
            Some(guard)
        }
        None => None,
    };

    let started_at = Utc::now();
    storage
        .transition_and_log(
            id,
            Some(ExecutionStatus::Running),
            &ExecutionEvent {
                execution_id: id.clone(),
                timestamp: started_at,
                event: EventType::Started,
            },
            None,
            Some(started_at),
            None,
            None,
            None,
        )
        .await?;

    let ctx = RunContext {
        execution_id: id.clone(),
        capture_id: None,
        params: execution.params.clone(),
        cancellation: cancellation.clone(),
    };
    let outcome = match tokio::time::timeout(Duration::from_millis(policy.timeout_ms), pipeline.run(ctx)).await {
        Ok(result) => result,
        Err(_) => RunResult::failed(RunError {
            category: ErrorCategory::Timeout,
            message: format!("execution exceeded {}ms timeout", policy.timeout_ms),
            details: None,
        }),
    };

    let finished_at = Utc::now();

    if cancellation.is_cancelled() {
        storage
            .transition_and_log(
                id,
                Some(ExecutionStatus::Cancelled),
                &ExecutionEvent {
                    execution_id: id.clone(),
                    timestamp: finished_at,
                    event: EventType::Cancelled {
                        reason: "cancelled".to_string(),
                    },
                },
                Some(finished_at),
                None,
                None,
                None,
                None,
            )
            .await?;
        info!("execution cancelled mid-run");
    } else {
        match outcome.status {
            RunStatus::Completed => {
                storage
                    .transition_and_log(
                        id,
                        Some(ExecutionStatus::Completed),
                        &ExecutionEvent {
                            execution_id: id.clone(),
                            timestamp: finished_at,
                            event: EventType::Completed {
                                result: outcome.metrics.clone(),
                            },
                        },
                        Some(finished_at),
                        None,
                        None,
                        outcome.metrics.as_ref(),
                        None,
                    )
                    .await?;
                info!("execution completed");
            }
            RunStatus::Failed => {
                let run_error = outcome.error.unwrap_or(RunError {
                    category: ErrorCategory::Permanent,
                    message: "pipeline reported failure without an error".to_string(),
                    details: None,
                });
                let spine_error = SpineError::new(run_error.category, run_error.message.clone());
                let spine_error = match run_error.details {
                    Some(details) => spine_error.with_details(details),
                    None => spine_error,
                };

                match decision::decide(run_error.category, execution.retry_count, &policy.backoff) {
                    FailureOutcome::Failed => {
                        storage
                            .transition_and_log(
                                id,
                                Some(ExecutionStatus::Failed),
                                &ExecutionEvent {
                                    execution_id: id.clone(),
                                    timestamp: finished_at,
                                    event: EventType::Failed {
                                        error: spine_error.clone(),
                                    },
                                },
                                Some(finished_at),
                                None,
                                None,
                                None,
                                Some(&spine_error),
                            )
                            .await?;
                        warn!(error = %spine_error, "execution failed permanently");
                    }
                    FailureOutcome::Retry => {
                        let delay = decision::retry_delay(execution.retry_count, &policy.backoff);
                        let next_attempt_at = finished_at
                            + ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::milliseconds(0));
                        // A `failed` event always precedes the transient `retrying`
                        // label, so history reads created/started/failed/retrying
                        // per attempt rather than skipping straight to retrying.
                        storage
                            .transition_and_log(
                                id,
                                None,
                                &ExecutionEvent {
                                    execution_id: id.clone(),
                                    timestamp: finished_at,
                                    event: EventType::Failed {
                                        error: spine_error.clone(),
                                    },
                                },
                                None,
                                None,
                                None,
                                None,
                                Some(&spine_error),
                            )
                            .await?;
                        storage
                            .transition_and_log(
                                id,
                                Some(ExecutionStatus::Pending),
                                &ExecutionEvent {
                                    execution_id: id.clone(),
                                    timestamp: finished_at,
                                    event: EventType::Retrying { next_attempt_at },
                                },
                                None,
                                None,
                                Some(execution.retry_count + 1),
                                None,
                                Some(&spine_error),
                            )
                            .await?;
                        info!(next_attempt_at = %next_attempt_at, retry_count = execution.retry_count + 1, "execution requeued for retry");
                    }
                    FailureOutcome::DeadLetter => {
                        let dead_letter_id = new_id();
                        storage
                            .transition_and_log(
                                id,
                                Some(ExecutionStatus::DeadLettered),
                                &ExecutionEvent {
                                    execution_id: id.clone(),
                                    timestamp: finished_at,
                                    event: EventType::DeadLettered {
                                        dead_letter_id: dead_letter_id.clone(),
                                    },
                                },
                                Some(finished_at),
                                None,
                                None,
                                None,
                                Some(&spine_error),
                            )
                            .await?;
                        warn!(error = %spine_error, retry_count = execution.retry_count, "execution exhausted retries, dead-lettered");
                        storage
                            .insert_dead_letter(&DeadLetter {
                                id: dead_letter_id,
                                execution_id: id.clone(),
                                pipeline: execution.pipeline.clone(),
                                params: execution.params.clone(),
                                error: spine_error,
                                retry_count: execution.retry_count,
                                created_at: finished_at,
                                resolved_at: None,
                                resolved_by: None,
                                time_to_exhaustion: Some((finished_at - execution.created_at).to_std().unwrap_or_default()),
                            })
                            .await?;
                    }
                }
            }
        }
    }

    if let Some(guard) = guard {
        guard.release(storage).await?;
    }

    storage.get_execution(id).await.map_err(Into::into)
}
