#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("storage error: {0}")]
    Storage(#[from] spine_storage::StorageError),
}
