//! Composition root (§6.2): wires one connection pool into every component
//! and exposes the caller API as plain async functions. No HTTP framework
//! lives here — wrapping these functions 1:1 behind an HTTP surface is left
//! to whatever embeds this crate (§12 non-goal).

mod error;

pub use error::CoreError;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use spine_config::SpineConfig;
use spine_dispatch::Pipeline;
use spine_policy::LanePolicy;
use spine_retry::BackoffPolicy;
use spine_storage::Storage;
use spine_types::{
    Alert, AlertChannel, Anomaly, BackfillPlan, DataReadiness, Execution, ExecutionEvent, Lane, PipelineSpec, Schedule,
    SpineId, TriggerSource, WorkflowRun,
};
use spine_webhook::WebhookConfig;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn new_id() -> SpineId {
    SpineId::new(Uuid::new_v4().to_string())
}

fn lane_policies(config: &SpineConfig) -> BTreeMap<String, LanePolicy> {
    config
        .dispatcher
        .lanes
        .iter()
        .map(|(name, lane)| {
            (
                name.clone(),
                LanePolicy {
                    max_concurrency: lane.max_concurrency,
                    backoff: BackoffPolicy {
                        base_ms: lane.backoff_base_ms,
                        cap_ms: lane.backoff_cap_ms,
                        max_retries: lane.max_retries,
                    },
                    timeout_ms: lane.timeout_ms,
                },
            )
        })
        .collect()
}

/// The process-wide handle every caller-facing function hangs off. Cheap to
/// clone: storage is an `Arc`-backed pool, and everything else behind an
/// `Arc<RwLock<_>>`/`Arc<Mutex<_>>`.
#[derive(Clone)]
pub struct SpineCore {
    storage: Storage,
    config: Arc<SpineConfig>,
    lanes: Arc<BTreeMap<String, LanePolicy>>,
    registry: Arc<RwLock<spine_registry::PipelineRegistry>>,
    pipelines: Arc<RwLock<HashMap<String, Arc<dyn Pipeline>>>>,
    alert_channels: Arc<RwLock<Vec<AlertChannel>>>,
    webhook_configs: Arc<RwLock<HashMap<String, WebhookConfig>>>,
    /// Executions currently inside `spine_dispatch::run`, keyed so `cancel`
    /// on a running execution has a live token to flip (§4.3: there is no
    /// DB-only way to stop a run already in flight).
    inflight: Arc<Mutex<HashMap<SpineId, CancellationToken>>>,
}

impl SpineCore {
    /// Connect storage and apply pending migrations (§6.3), then build a
    /// core with an empty pipeline registry — callers register their own
    /// [`Pipeline`] implementations with [`SpineCore::register_pipeline`]
    /// before submitting anything.
    pub async fn connect(config: SpineConfig) -> Result<Self, CoreError> {
        let storage = Storage::connect(&config.database.url).await?;
        spine_schema::migrate(storage.pool()).await.map_err(|e| {
            spine_storage::StorageError::Permanent(format!("migration failed: {e}"))
        })?;
        Ok(Self::from_storage(config, storage))
    }

    pub fn from_storage(config: SpineConfig, storage: Storage) -> Self {
        let lanes = lane_policies(&config);
        Self {
            storage,
            config: Arc::new(config),
            lanes: Arc::new(lanes),
            registry: Arc::new(RwLock::new(spine_registry::PipelineRegistry::new())),
            pipelines: Arc::new(RwLock::new(HashMap::new())),
            alert_channels: Arc::new(RwLock::new(Vec::new())),
            webhook_configs: Arc::new(RwLock::new(HashMap::new())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Register a pipeline's declared metadata and its runtime handler
    /// together — the registry validates submit calls against the declared
    /// lanes and params schema, `run` dispatches into the handler.
    pub async fn register_pipeline(&self, spec: PipelineSpec, handler: Arc<dyn Pipeline>) -> Result<(), CoreError> {
        let name = spec.name.clone();
        self.registry.write().await.register(spec)?;
        self.pipelines.write().await.insert(name, handler);
        Ok(())
    }

    pub async fn set_alert_channels(&self, channels: Vec<AlertChannel>) {
        *self.alert_channels.write().await = channels;
    }

    pub async fn set_webhook_config(&self, channel_name: &str, config: WebhookConfig) {
        self.webhook_configs.write().await.insert(channel_name.to_string(), config);
    }

    // ---- Pipelines (§6.2) ----------------------------------------------

    pub async fn list_pipelines(&self, prefix: Option<&str>) -> Vec<PipelineSpec> {
        let registry = self.registry.read().await;
        registry.list_by_prefix(prefix.unwrap_or("")).into_iter().cloned().collect()
    }

    pub async fn describe_pipeline(&self, name: &str) -> Option<PipelineSpec> {
        self.registry.read().await.get(name).cloned()
    }

    // ---- Executions (§4.3, §6.2) ---------------------------------------

    #[tracing::instrument(skip(self, raw_params))]
    pub async fn submit(
        &self,
        pipeline: &str,
        raw_params: Map<String, Value>,
        lane: Lane,
        trigger_source: TriggerSource,
        caller_idempotency_key: Option<String>,
    ) -> Result<Execution, CoreError> {
        let registry = self.registry.read().await;
        let execution = spine_dispatch::submit(&self.storage, &registry, pipeline, &raw_params, lane, trigger_source, caller_idempotency_key).await?;
        Ok(execution)
    }

    pub async fn get_execution(&self, id: &SpineId) -> Result<Execution, CoreError> {
        Ok(self.storage.get_execution(id).await?)
    }

    pub async fn execution_events(&self, id: &SpineId) -> Result<Vec<ExecutionEvent>, CoreError> {
        Ok(self.storage.list_execution_events(id).await?)
    }

    pub async fn retry(&self, id: &SpineId, mutated_params: Option<Value>) -> Result<Execution, CoreError> {
        Ok(spine_dispatch::retry(&self.storage, id, mutated_params).await?)
    }

    /// Cancel `id`. A `pending` execution transitions immediately; a
    /// `running` one is cancelled cooperatively by flipping its live
    /// [`CancellationToken`] and letting the in-flight `run` observe it on
    /// its next poll (§4.3).
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: &SpineId, reason: String) -> Result<Execution, CoreError> {
        if let Some(token) = self.inflight.lock().await.get(id) {
            token.cancel();
            info!(execution_id = %id, "cancellation requested for in-flight execution");
            return Ok(self.storage.get_execution(id).await?);
        }
        Ok(spine_dispatch::cancel_pending(&self.storage, id, reason).await?)
    }

    /// Run a `pending` execution to completion, using whatever
    /// [`Pipeline`] handler was registered for its pipeline name. Holds the
    /// execution's [`CancellationToken`] in the in-flight map for the
    /// duration of the run so [`SpineCore::cancel`] can reach it.
    #[tracing::instrument(skip(self))]
    pub async fn run_execution(&self, id: &SpineId) -> Result<Execution, CoreError> {
        let execution = self.storage.get_execution(id).await?;
        let handler = self
            .pipelines
            .read()
            .await
            .get(&execution.pipeline)
            .cloned()
            .ok_or_else(|| CoreError::PipelineHandlerMissing(execution.pipeline.clone()))?;
        let policy = spine_policy::resolve_lane_policy(&self.lanes, execution.lane).clone();

        let token = CancellationToken::new();
        self.inflight.lock().await.insert(id.clone(), token.clone());
        let concurrency_lock_key = execution.logical_key.clone();
        let result = spine_dispatch::run(&self.storage, handler.as_ref(), &policy, concurrency_lock_key.as_deref(), id, token).await;
        self.inflight.lock().await.remove(id);
        Ok(result?)
    }

    // ---- Schedules (§4.6, §6.2) ----------------------------------------

    pub async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), CoreError> {
        Ok(self.storage.upsert_schedule(schedule).await?)
    }

    pub async fn get_schedule(&self, name: &str) -> Result<Option<Schedule>, CoreError> {
        Ok(self.storage.get_schedule(name).await?)
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, CoreError> {
        Ok(self.storage.list_schedules().await?)
    }

    pub async fn set_schedule_enabled(&self, name: &str, enabled: bool) -> Result<(), CoreError> {
        Ok(self.storage.set_schedule_enabled(name, enabled).await?)
    }

    /// The `limit` schedules with the soonest `next_run_at` (§6.2
    /// `upcoming(limit)`).
    pub async fn upcoming_schedules(&self, limit: usize) -> Result<Vec<Schedule>, CoreError> {
        let mut schedules = self.storage.list_schedules().await?;
        schedules.retain(|s| s.enabled && s.next_run_at.is_some());
        schedules.sort_by_key(|s| s.next_run_at);
        schedules.truncate(limit);
        Ok(schedules)
    }

    /// Enabled schedules whose `next_run_at` has already passed (§6.2
    /// `overdue`) — a schedule only shows up here between a missed tick and
    /// the next evaluation catching it.
    pub async fn overdue_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, CoreError> {
        let mut schedules = self.storage.list_schedules().await?;
        schedules.retain(|s| s.enabled && s.next_run_at.is_some_and(|t| t < now));
        Ok(schedules)
    }

    // ---- Quality / Readiness (§2.5, §6.2) -------------------------------

    pub async fn anomalies(&self, domain: &str) -> Result<Vec<Anomaly>, CoreError> {
        Ok(self.storage.list_anomalies(domain).await?)
    }

    pub async fn ack_anomaly(&self, anomaly_id: &SpineId, reason: &str) -> Result<(), CoreError> {
        debug!(anomaly_id = %anomaly_id, reason, "anomaly acknowledged");
        Ok(self.storage.resolve_anomaly(anomaly_id, Utc::now()).await?)
    }

    pub async fn readiness(&self, domain: &str, partition_key: &str, ready_for: &str) -> Result<Option<DataReadiness>, CoreError> {
        Ok(self.storage.get_data_readiness(domain, partition_key, ready_for).await?)
    }

    pub async fn certify(&self, domain: &str, partition_key: &str, ready_for: &str, note: &str) -> Result<DataReadiness, CoreError> {
        Ok(spine_capture::certify(&self.storage, domain, partition_key, ready_for, note).await?)
    }

    pub async fn block(&self, domain: &str, partition_key: &str, reason: &str) -> Result<(), CoreError> {
        Ok(spine_capture::block(&self.storage, new_id(), domain, partition_key, reason).await?)
    }

    // ---- Watermark / Backfill (§4.9, §6.2) ------------------------------

    pub async fn backfill_plan(&self, plan_id: &str) -> Result<BackfillPlan, CoreError> {
        Ok(self.storage.get_backfill_plan(plan_id).await?)
    }

    // ---- Workflows (§4.7, §6.2) -----------------------------------------

    pub async fn start_workflow(
        &self,
        workflow_name: &str,
        workflow_version: &str,
        params: Value,
        steps: &[spine_workflow::StepSpec],
    ) -> Result<WorkflowRun, CoreError> {
        let run = spine_workflow::start(&self.storage, new_id(), workflow_name, workflow_version, params, steps).await?;
        let registry = self.registry.read().await;
        let run = spine_workflow::advance(&self.storage, &registry, &run.id).await?;
        Ok(run)
    }

    pub async fn get_workflow_run(&self, id: &SpineId) -> Result<WorkflowRun, CoreError> {
        Ok(self.storage.get_workflow_run(id).await?)
    }

    pub async fn advance_workflow(&self, run_id: &SpineId) -> Result<WorkflowRun, CoreError> {
        let registry = self.registry.read().await;
        Ok(spine_workflow::advance(&self.storage, &registry, run_id).await?)
    }

    // ---- Alerts (§4.8) ---------------------------------------------------

    pub async fn publish_alert(&self, alert: &Alert) -> Result<spine_alerts::PublishReport, CoreError> {
        let channels = self.alert_channels.read().await;
        let webhook_configs = self.webhook_configs.read().await;
        let backoff = BackoffPolicy {
            base_ms: 30_000,
            cap_ms: 900_000,
            max_retries: 5,
        };
        Ok(spine_alerts::publish(
            &self.storage,
            &channels,
            alert,
            &backoff,
            self.config.alerts.channel_disable_after_consecutive_failures,
            &webhook_configs,
        )
        .await?)
    }

    // ---- Background tasks (§11.1) ---------------------------------------

    /// Spawn the scheduler-tick and work-item-reclaim loops (§4.6, §4.5),
    /// each on its own `tokio::time::interval`. Returns the join handles so
    /// the embedding process can await or abort them at shutdown.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![self.spawn_scheduler_loop(), self.spawn_reclaim_loop()]
    }

    fn spawn_scheduler_loop(&self) -> JoinHandle<()> {
        let core = self.clone();
        let tick_ms = self.config.scheduler.tick_ms;
        tokio::spawn(async move {
            let holder = spine_lock::default_holder();
            let mut ticker = tokio::time::interval(StdDuration::from_millis(tick_ms));
            loop {
                ticker.tick().await;
                let registry = core.registry.read().await;
                match spine_scheduler::tick(&core.storage, &registry, &holder, Utc::now()).await {
                    Ok(report) => debug!(?report, "scheduler tick complete"),
                    Err(err) => error!(error = %err, "scheduler tick failed"),
                }
            }
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let core = self.clone();
        let reclaim_interval_ms = self.config.workitem.reclaim_interval_ms;
        let lease_ttl_ms = self.config.workitem.lease_ttl_ms as i64;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(reclaim_interval_ms));
            loop {
                ticker.tick().await;
                match spine_workqueue::reclaim(&core.storage, Utc::now(), lease_ttl_ms).await {
                    Ok(reclaimed) if reclaimed > 0 => warn!(reclaimed, "reclaimed expired work item leases"),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "work item reclaim failed"),
                }
            }
        })
    }
}
