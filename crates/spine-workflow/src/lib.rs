//! DAG workflow runner (§4.7). A workflow run is a set of [`WorkflowStep`]
//! rows leveled by [`spine_dag::levels`] at plan time; [`advance`] is the
//! tick that turns newly-satisfied `pending` steps into `running` ones and
//! newly-unreachable ones into `skipped`, driven to completion by repeated
//! calls from whatever reports step outcomes back via [`report_step_result`].
//!
//! Step types `Parallel`/`Sequential` are expected to already be flattened
//! into individual `Pipeline`/`External` steps with the right `depends_on`
//! by the caller building the step list — the leveling and readiness logic
//! here only understands the flat dependency graph, not nested groups.

mod decision;
mod error;

pub use decision::{final_status, is_run_terminal, ready_steps, steps_to_skip};
pub use error::WorkflowError;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use spine_dag::levels;
use spine_registry::PipelineRegistry;
use spine_storage::Storage;
use spine_types::{
    Lane, SpineId, StepStatus, StepType, TriggerSource, WorkflowEvent, WorkflowRun, WorkflowRunStatus, WorkflowStep,
};
use tracing::{info, warn};

fn idempotency_key(run_id: &SpineId, step_name: Option<&str>, event_type: &str, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_str().as_bytes());
    hasher.update(step_name.unwrap_or("").as_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(attempt.to_le_bytes());
    hex::encode(hasher.finalize())
}

async fn emit(storage: &Storage, run_id: &SpineId, step_name: Option<&str>, event_type: &str, attempt: u32, data: Value) -> Result<(), WorkflowError> {
    storage
        .insert_workflow_event(&WorkflowEvent {
            run_id: run_id.clone(),
            step_name: step_name.map(str::to_string),
            event_type: event_type.to_string(),
            idempotency_key: idempotency_key(run_id, step_name, event_type, attempt),
            data,
            timestamp: Utc::now(),
        })
        .await?;
    Ok(())
}

/// A step definition as the caller supplies it before a run exists.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub step_type: StepType,
    pub depends_on: Vec<String>,
    pub run_on_failure: bool,
    pub max_attempts: u32,
}

/// Plan and persist a new run: validates the DAG with [`spine_dag::levels`],
/// writes one `pending` `WorkflowStep` per definition, and opens the
/// `WorkflowRun` itself `pending` (§4.7).
#[tracing::instrument(skip(storage, steps), fields(workflow_name, workflow_version))]
pub async fn start(
    storage: &Storage,
    run_id: SpineId,
    workflow_name: &str,
    workflow_version: &str,
    params: Value,
    steps: &[StepSpec],
) -> Result<WorkflowRun, WorkflowError> {
    let dep_map = steps.iter().map(|s| (s.name.clone(), s.depends_on.clone())).collect();
    levels(&dep_map)?;

    let now = Utc::now();
    let run = WorkflowRun {
        id: run_id.clone(),
        workflow_name: workflow_name.to_string(),
        workflow_version: workflow_version.to_string(),
        params,
        status: WorkflowRunStatus::Pending,
        total_steps: steps.len() as u32,
        completed_steps: 0,
        failed_steps: 0,
        skipped_steps: 0,
        created_at: now,
        started_at: None,
        completed_at: None,
    };
    storage.insert_workflow_run(&run).await?;
    for s in steps {
        storage
            .upsert_workflow_step(&WorkflowStep {
                run_id: run_id.clone(),
                step_name: s.name.clone(),
                attempt: 1,
                step_type: s.step_type.clone(),
                depends_on: s.depends_on.clone(),
                run_on_failure: s.run_on_failure,
                max_attempts: s.max_attempts.max(1),
                status: StepStatus::Pending,
                execution_id: None,
                started_at: None,
                completed_at: None,
            })
            .await?;
    }
    emit(storage, &run_id, None, "run_created", 0, serde_json::json!({})).await?;
    info!(run_id = %run_id, total_steps = run.total_steps, "workflow run created");
    Ok(run)
}

/// One tick: skip newly-unreachable steps, dispatch newly-ready ones, and
/// close the run out if nothing is left in flight (§4.7). Idempotent to
/// call repeatedly — a step already `running`/terminal is left untouched.
#[tracing::instrument(skip(storage, registry), fields(run_id = %run_id))]
pub async fn advance(storage: &Storage, registry: &PipelineRegistry, run_id: &SpineId) -> Result<WorkflowRun, WorkflowError> {
    let mut run = storage.get_workflow_run(run_id).await?;
    let mut steps = storage.list_workflow_steps(run_id).await?;
    latest_attempt_per_step(&mut steps);

    for name in steps_to_skip(&steps) {
        if let Some(step) = steps.iter_mut().find(|s| s.step_name == name) {
            step.status = StepStatus::Skipped;
            step.completed_at = Some(Utc::now());
            storage.upsert_workflow_step(step).await?;
            emit(storage, run_id, Some(&name), "step_skipped", step.attempt, serde_json::json!({})).await?;
            warn!(step = %name, "step skipped: a dependency failed without run_on_failure");
        }
    }

    let ready = ready_steps(&steps);
    if !ready.is_empty() && run.status == WorkflowRunStatus::Pending {
        run.status = WorkflowRunStatus::Running;
        run.started_at = Some(Utc::now());
    }
    for name in &ready {
        if let Some(step) = steps.iter_mut().find(|s| &s.step_name == name) {
            dispatch_step(storage, registry, run_id, step).await?;
        }
    }

    run.completed_steps = steps.iter().filter(|s| s.status == StepStatus::Completed).count() as u32;
    run.failed_steps = steps.iter().filter(|s| s.status == StepStatus::Failed).count() as u32;
    run.skipped_steps = steps.iter().filter(|s| s.status == StepStatus::Skipped).count() as u32;
    if is_run_terminal(&steps) {
        run.status = final_status(&steps);
        run.completed_at = Some(Utc::now());
        info!(run_id = %run_id, status = ?run.status, "workflow run terminal");
    }
    storage.update_workflow_run_counters(&run).await?;
    Ok(run)
}

async fn dispatch_step(storage: &Storage, registry: &PipelineRegistry, run_id: &SpineId, step: &mut WorkflowStep) -> Result<(), WorkflowError> {
    step.status = StepStatus::Running;
    step.started_at = Some(Utc::now());
    match &step.step_type {
        StepType::Pipeline { pipeline } => {
            let raw_params = serde_json::Map::new();
            let execution = spine_dispatch::submit(storage, registry, pipeline, &raw_params, Lane::Normal, TriggerSource::Workflow, None).await?;
            step.execution_id = Some(execution.id.clone());
            info!(step = %step.step_name, execution_id = %execution.id, "workflow step dispatched to pipeline");
        }
        StepType::External { handle } => {
            info!(step = %step.step_name, handle = %handle, "workflow step handed off to external system");
        }
        StepType::Conditional { when } => {
            let proceed = evaluate_when(when, &step.depends_on);
            if proceed {
                step.status = StepStatus::Completed;
                step.completed_at = Some(Utc::now());
            } else {
                step.status = StepStatus::Skipped;
                step.completed_at = Some(Utc::now());
            }
        }
        StepType::Parallel { .. } | StepType::Sequential { .. } => {
            // Group steps are expected to have been flattened into their
            // children before the run was started; a bare group step here
            // has nothing of its own to do.
            step.status = StepStatus::Completed;
            step.completed_at = Some(Utc::now());
        }
    }
    storage.upsert_workflow_step(step).await?;
    emit(storage, run_id, Some(&step.step_name), "step_started", step.attempt, serde_json::json!({})).await?;
    Ok(())
}

/// Placeholder truth-table: a `when` expression with no special syntax is
/// always true; `"!"`-prefixed expressions are always false. A full
/// predicate language is out of scope here.
fn evaluate_when(when: &str, _depends_on: &[String]) -> bool {
    !when.starts_with('!')
}

/// Record that `step_name`'s delegated execution (or external handle)
/// resolved, retrying per `max_attempts` before the step becomes terminal
/// (§4.7). Callers invoke this from wherever they observe the delegated
/// execution complete, then call [`advance`] again to cascade.
#[tracing::instrument(skip(storage), fields(run_id = %run_id))]
pub async fn report_step_result(storage: &Storage, run_id: &SpineId, step_name: &str, succeeded: bool) -> Result<(), WorkflowError> {
    let mut steps = storage.list_workflow_steps(run_id).await?;
    latest_attempt_per_step(&mut steps);
    let Some(step) = steps.into_iter().find(|s| s.step_name == step_name) else {
        return Ok(());
    };
    let mut updated = step.clone();
    updated.completed_at = Some(Utc::now());
    if succeeded {
        updated.status = StepStatus::Completed;
        storage.upsert_workflow_step(&updated).await?;
        emit(storage, run_id, Some(step_name), "step_completed", updated.attempt, serde_json::json!({})).await?;
    } else if updated.attempt < updated.max_attempts {
        storage.upsert_workflow_step(&WorkflowStep {
            status: StepStatus::Failed,
            ..updated.clone()
        }).await?;
        emit(storage, run_id, Some(step_name), "step_retrying", updated.attempt, serde_json::json!({})).await?;
        let mut retry = updated;
        retry.attempt += 1;
        retry.status = StepStatus::Pending;
        retry.execution_id = None;
        retry.started_at = None;
        retry.completed_at = None;
        storage.upsert_workflow_step(&retry).await?;
    } else {
        updated.status = StepStatus::Failed;
        storage.upsert_workflow_step(&updated).await?;
        emit(storage, run_id, Some(step_name), "step_failed", updated.attempt, serde_json::json!({})).await?;
    }
    Ok(())
}

/// Collapses a run's step history to one row per `step_name`: the highest
/// `attempt`, which is the only one readiness/skip/terminal logic ever
/// looks at.
fn latest_attempt_per_step(steps: &mut Vec<WorkflowStep>) {
    steps.sort_by(|a, b| a.step_name.cmp(&b.step_name).then(b.attempt.cmp(&a.attempt)));
    steps.dedup_by(|a, b| a.step_name == b.step_name);
}
