//! `core_watermarks`, `core_backfill_plans`, `core_bitemporal_facts` (§6.3, §4.9).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_types::{BackfillPlan, BackfillStatus, BitemporalFact, Watermark};

use crate::error::StorageError;
use crate::pool::Storage;

fn backfill_status_str(s: BackfillStatus) -> &'static str {
    match s {
        BackfillStatus::Planned => "planned",
        BackfillStatus::Running => "running",
        BackfillStatus::Completed => "completed",
        BackfillStatus::Failed => "failed",
        BackfillStatus::Cancelled => "cancelled",
    }
}

impl Storage {
    pub async fn get_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
    ) -> Result<Option<Watermark>, StorageError> {
        let row = sqlx::query_as::<_, WatermarkRow>(
            "SELECT * FROM core_watermarks WHERE domain = $1 AND source = $2 AND partition_key = $3",
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// `high_water = GREATEST(high_water, x)` — monotone under normal
    /// advance (§8.7). A caller performing an explicit rewind must delete
    /// and reinsert, which is intentionally not exposed here: rewinds always
    /// go through `spine-watermark`'s anomaly-logging path.
    pub async fn advance_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        low_water: DateTime<Utc>,
        high_water: DateTime<Utc>,
        metadata: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_watermarks (domain, source, partition_key, low_water, high_water, metadata, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (domain, source, partition_key) DO UPDATE SET
                low_water = LEAST(core_watermarks.low_water, EXCLUDED.low_water),
                high_water = GREATEST(core_watermarks.high_water, EXCLUDED.high_water),
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .bind(low_water)
        .bind(high_water)
        .bind(metadata)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unconditional overwrite for an explicit rewind; the anomaly record
    /// itself is written by the caller in the same logical operation (§8.7).
    pub async fn rewind_watermark(
        &self,
        domain: &str,
        source: &str,
        partition_key: &str,
        high_water: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE core_watermarks SET high_water = $4, updated_at = $5 WHERE domain = $1 AND source = $2 AND partition_key = $3",
        )
        .bind(domain)
        .bind(source)
        .bind(partition_key)
        .bind(high_water)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_backfill_plan(&self, plan: &BackfillPlan) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_backfill_plans (
                plan_id, domain, source, partition_keys, completed_keys,
                failed_keys, status, checkpoint
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (plan_id) DO UPDATE SET
                completed_keys = EXCLUDED.completed_keys,
                failed_keys = EXCLUDED.failed_keys,
                status = EXCLUDED.status,
                checkpoint = EXCLUDED.checkpoint
            "#,
        )
        .bind(&plan.plan_id)
        .bind(&plan.domain)
        .bind(&plan.source)
        .bind(&plan.partition_keys)
        .bind(plan.completed_keys.iter().cloned().collect::<Vec<_>>())
        .bind(serde_json::to_value(&plan.failed_keys).map_err(|e| StorageError::Permanent(e.to_string()))?)
        .bind(backfill_status_str(plan.status))
        .bind(&plan.checkpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_backfill_plan(&self, plan_id: &str) -> Result<BackfillPlan, StorageError> {
        let row = sqlx::query_as::<_, BackfillPlanRow>("SELECT * FROM core_backfill_plans WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    /// Close the currently open system-interval for `entity_key` and open a
    /// new one for the incoming fact, as one transaction (§3 `BitemporalFact`
    /// never-overlapping invariant).
    pub async fn write_bitemporal_fact(&self, fact: &BitemporalFact) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE core_bitemporal_facts SET system_to = $2 WHERE entity_key = $1 AND system_to IS NULL",
        )
        .bind(&fact.entity_key)
        .bind(fact.system_from)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO core_bitemporal_facts (entity_key, valid_from, valid_to, system_from, system_to, payload, provenance)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(&fact.entity_key)
        .bind(fact.valid_from)
        .bind(fact.valid_to)
        .bind(fact.system_from)
        .bind(fact.system_to)
        .bind(&fact.payload)
        .bind(&fact.provenance)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct WatermarkRow {
    domain: String,
    source: String,
    partition_key: String,
    low_water: DateTime<Utc>,
    high_water: DateTime<Utc>,
    metadata: Value,
    updated_at: DateTime<Utc>,
}

impl From<WatermarkRow> for Watermark {
    fn from(row: WatermarkRow) -> Self {
        Watermark {
            domain: row.domain,
            source: row.source,
            partition_key: row.partition_key,
            low_water: row.low_water,
            high_water: row.high_water,
            metadata: row.metadata,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BackfillPlanRow {
    plan_id: String,
    domain: String,
    source: String,
    partition_keys: Vec<String>,
    completed_keys: Vec<String>,
    failed_keys: Value,
    status: String,
    checkpoint: Option<String>,
}

impl TryFrom<BackfillPlanRow> for BackfillPlan {
    type Error = StorageError;

    fn try_from(row: BackfillPlanRow) -> Result<Self, StorageError> {
        Ok(BackfillPlan {
            plan_id: row.plan_id,
            domain: row.domain,
            source: row.source,
            partition_keys: row.partition_keys,
            completed_keys: row.completed_keys.into_iter().collect::<BTreeSet<_>>(),
            failed_keys: serde_json::from_value::<BTreeMap<String, String>>(row.failed_keys)
                .map_err(|e| StorageError::Permanent(e.to_string()))?,
            status: match row.status.as_str() {
                "running" => BackfillStatus::Running,
                "completed" => BackfillStatus::Completed,
                "failed" => BackfillStatus::Failed,
                "cancelled" => BackfillStatus::Cancelled,
                _ => BackfillStatus::Planned,
            },
            checkpoint: row.checkpoint,
        })
    }
}
