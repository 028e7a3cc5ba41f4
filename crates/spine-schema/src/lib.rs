//! Schema migrations and version bookkeeping. `migrate` is the only entry
//! point: it creates `_migrations` if absent, then applies every migration
//! whose `version` isn't recorded there yet, each inside its own transaction
//! so a failure partway through a migration never leaves `_migrations`
//! claiming a version that didn't fully apply.
//!
//! Versions are plain incrementing integers — there's one schema here, not
//! one per storage backend, so a namespaced version string has nothing left
//! to name.

use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("migration {0} failed: {1}")]
    Migration(i64, String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Applied in order, each exactly once. Adding a new table or column means
/// appending a new entry here, never editing an already-shipped one.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core_tables",
        sql: include_str!("migrations/0001_core_tables.sql"),
    },
    Migration {
        version: 2,
        name: "readiness_dependency_tables",
        sql: include_str!("migrations/0002_readiness_dependency_tables.sql"),
    },
];

/// Current highest applied version, or `0` if `_migrations` is empty/absent.
pub async fn current_version(pool: &PgPool) -> Result<i64, SchemaError> {
    ensure_migrations_table(pool).await?;
    let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await?;
    Ok(row.0.unwrap_or(0))
}

/// Apply every migration newer than the current version, each in its own
/// transaction, recording it in `_migrations` on success.
pub async fn migrate(pool: &PgPool) -> Result<i64, SchemaError> {
    ensure_migrations_table(pool).await?;
    let mut applied = current_version(pool).await?;

    for migration in MIGRATIONS {
        if migration.version <= applied {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| SchemaError::Migration(migration.version, e.to_string()))?;
        sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        applied = migration.version;
    }
    Ok(applied)
}

async fn ensure_migrations_table(pool: &PgPool) -> Result<(), SchemaError> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            version BIGINT PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_increasing() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        assert_eq!(versions, sorted, "migrations must be declared in version order");
        assert_eq!(
            versions.iter().collect::<std::collections::HashSet<_>>().len(),
            versions.len(),
            "migration versions must be unique"
        );
    }
}
