use spine_types::{ErrorCategory, SpineError};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] spine_registry::RegistryError),
    #[error("storage error: {0}")]
    Storage(#[from] spine_storage::StorageError),
    #[error("lock error: {0}")]
    Lock(#[from] spine_lock::LockError),
    #[error("execution {id} cannot {op} from its current state")]
    InvalidTransition { id: String, op: &'static str },
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<DispatchError> for SpineError {
    fn from(err: DispatchError) -> Self {
        let category = match &err {
            DispatchError::Registry(e) => return e.clone().into(),
            DispatchError::Storage(spine_storage::StorageError::NotFound) => ErrorCategory::NotFound,
            DispatchError::Storage(spine_storage::StorageError::ConstraintConflict(_)) => ErrorCategory::Conflict,
            DispatchError::Storage(spine_storage::StorageError::Transient(_)) => ErrorCategory::Transient,
            DispatchError::Storage(spine_storage::StorageError::Permanent(_)) => ErrorCategory::Permanent,
            DispatchError::Lock(_) => ErrorCategory::Conflict,
            DispatchError::InvalidTransition { .. } => ErrorCategory::Conflict,
            DispatchError::Encoding(_) => ErrorCategory::Permanent,
        };
        SpineError::new(category, err.to_string())
    }
}
