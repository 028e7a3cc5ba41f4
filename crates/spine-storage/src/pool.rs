use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::StorageError;

/// A connected storage handle. Cloning is cheap — `sqlx::PgPool` is an `Arc`
/// around a connection pool, so every component crate can hold its own
/// `Storage` without sharing a lifetime.
#[derive(Clone)]
pub struct Storage {
    pub(crate) pool: PgPool,
}

impl Storage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(StorageError::from)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
