#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] spine_storage::StorageError),
    #[error("lock error: {0}")]
    Lock(#[from] spine_lock::LockError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] spine_dispatch::DispatchError),
    #[error("invalid cron expression '{expression}': {source}")]
    InvalidCron {
        expression: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),
    #[error("invalid interval expression '{0}'")]
    InvalidInterval(String),
    #[error("invalid 'at' expression '{0}'")]
    InvalidAt(String),
}
