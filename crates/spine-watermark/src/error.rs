#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    #[error("storage error: {0}")]
    Storage(#[from] spine_storage::StorageError),
    #[error("work queue error: {0}")]
    WorkQueue(#[from] spine_workqueue::WorkQueueError),
}
