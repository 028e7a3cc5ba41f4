#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("storage error: {0}")]
    Storage(#[from] spine_storage::StorageError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] spine_dispatch::DispatchError),
    #[error("workflow DAG error: {0}")]
    Dag(#[from] spine_dag::DagError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
