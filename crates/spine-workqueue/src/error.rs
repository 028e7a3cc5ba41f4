#[derive(Debug, thiserror::Error)]
pub enum WorkQueueError {
    #[error("storage error: {0}")]
    Storage(#[from] spine_storage::StorageError),
    #[error("work item {0} not found")]
    NotFound(String),
}
