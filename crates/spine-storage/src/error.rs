/// Bounded error taxonomy surfaced by every repository method (§4.1, §7).
/// `classify` is the only place that inspects a raw `sqlx::Error`; everything
/// above this crate matches on these three variants instead.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("storage constraint conflict: {0}")]
    ConstraintConflict(String),
    #[error("storage error: {0}")]
    Permanent(String),
    #[error("not found")]
    NotFound,
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        classify(err)
    }
}

/// Postgres SQLSTATE `23505` (`unique_violation`) is the only conflict we
/// expect to hit in practice (idempotency keys, lock names, work-item
/// partition keys) — everything else that looks transport-shaped is
/// transient, and anything left over is permanent.
pub fn classify(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(ref db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                StorageError::ConstraintConflict(db_err.message().to_string())
            } else {
                StorageError::Permanent(db_err.message().to_string())
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StorageError::Transient(err.to_string()),
        other => StorageError::Permanent(other.to_string()),
    }
}
