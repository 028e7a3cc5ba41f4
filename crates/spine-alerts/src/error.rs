#[derive(Debug, thiserror::Error)]
pub enum AlertsError {
    #[error("storage error: {0}")]
    Storage(#[from] spine_storage::StorageError),
}
