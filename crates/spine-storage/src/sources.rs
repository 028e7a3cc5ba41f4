//! `core_sources`, `core_source_fetches`, `core_source_cache` (§6.3, §3).

use chrono::{DateTime, Utc};
use spine_types::{Source, SourceCache, SourceFetch};

use crate::error::StorageError;
use crate::pool::Storage;

impl Storage {
    pub async fn upsert_source(&self, source: &Source) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_sources (name, uri_template, domain) VALUES ($1,$2,$3)
            ON CONFLICT (name) DO UPDATE SET uri_template = EXCLUDED.uri_template, domain = EXCLUDED.domain
            "#,
        )
        .bind(&source.name)
        .bind(&source.uri_template)
        .bind(&source.domain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_source_fetch(&self, fetch: &SourceFetch) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_source_fetches (source_name, fetched_at, content_hash, etag, last_modified, status)
            VALUES ($1,$2,$3,$4,$5,$6)
            "#,
        )
        .bind(&fetch.source_name)
        .bind(fetch.fetched_at)
        .bind(&fetch.content_hash)
        .bind(&fetch.etag)
        .bind(fetch.last_modified)
        .bind(&fetch.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `content_hash` is the cache key; a hit means the fetch can be skipped
    /// (§3 `SourceCache`).
    pub async fn find_cached(&self, content_hash: &str) -> Result<Option<SourceCache>, StorageError> {
        let row = sqlx::query_as::<_, (String, i64, DateTime<Utc>)>(
            "SELECT content_hash, byte_len, cached_at FROM core_source_cache WHERE content_hash = $1",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(content_hash, byte_len, cached_at)| SourceCache {
            content_hash,
            byte_len: byte_len as u64,
            cached_at,
        }))
    }

    pub async fn insert_cache_entry(&self, cache: &SourceCache) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO core_source_cache (content_hash, byte_len, cached_at) VALUES ($1,$2,$3) ON CONFLICT (content_hash) DO NOTHING",
        )
        .bind(&cache.content_hash)
        .bind(cache.byte_len as i64)
        .bind(cache.cached_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
