/// Aggregates every component boundary's error into one caller-facing type
/// (§11.2). Individual components keep their own closed `thiserror` enums;
/// this is only where heterogeneous errors meet, at the composition root.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("storage error: {0}")]
    Storage(#[from] spine_storage::StorageError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] spine_dispatch::DispatchError),
    #[error("lock error: {0}")]
    Lock(#[from] spine_lock::LockError),
    #[error("registry error: {0}")]
    Registry(#[from] spine_registry::RegistryError),
    #[error("work queue error: {0}")]
    WorkQueue(#[from] spine_workqueue::WorkQueueError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] spine_scheduler::SchedulerError),
    #[error("workflow error: {0}")]
    Workflow(#[from] spine_workflow::WorkflowError),
    #[error("alerts error: {0}")]
    Alerts(#[from] spine_alerts::AlertsError),
    #[error("watermark error: {0}")]
    Watermark(#[from] spine_watermark::WatermarkError),
    #[error("capture error: {0}")]
    Capture(#[from] spine_capture::CaptureError),
    #[error("pipeline {0} has no registered handler")]
    PipelineHandlerMissing(String),
}
