//! `core_manifest`, `core_rejects`, `core_quality`, `core_anomalies`,
//! `core_data_readiness` (§6.3, §2.5).

use chrono::{DateTime, Utc};
use spine_types::{AlertSeverity, Anomaly, DataReadiness, Manifest, QualityCheck, QualityStatus, Reject};

use crate::error::StorageError;
use crate::pool::Storage;

fn quality_status_str(s: QualityStatus) -> &'static str {
    match s {
        QualityStatus::Pass => "pass",
        QualityStatus::Warn => "warn",
        QualityStatus::Fail => "fail",
    }
}

fn severity_str(s: AlertSeverity) -> &'static str {
    match s {
        AlertSeverity::Info => "INFO",
        AlertSeverity::Warn => "WARN",
        AlertSeverity::Error => "ERROR",
        AlertSeverity::Critical => "CRITICAL",
    }
}

impl Storage {
    /// Idempotent per `(domain, partition_key, stage)`: a retried stage
    /// re-reports the same row rather than duplicating it (§2.5).
    pub async fn upsert_manifest(&self, manifest: &Manifest) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_manifest (domain, partition_key, stage, row_count, metrics, execution_id, batch_id, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (domain, partition_key, stage) DO UPDATE SET
                row_count = EXCLUDED.row_count, metrics = EXCLUDED.metrics,
                execution_id = EXCLUDED.execution_id, batch_id = EXCLUDED.batch_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&manifest.domain)
        .bind(&manifest.partition_key)
        .bind(&manifest.stage)
        .bind(manifest.row_count as i64)
        .bind(&manifest.metrics)
        .bind(manifest.execution_id.as_str())
        .bind(&manifest.batch_id)
        .bind(manifest.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Partition keys already produced for `(domain, stage)` — the "subtract
    /// partitions already present" step of backfill planning (§4.9.2).
    pub async fn list_manifest_partition_keys(&self, domain: &str, stage: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT partition_key FROM core_manifest WHERE domain = $1 AND stage = $2")
            .bind(domain)
            .bind(stage)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    pub async fn insert_reject(&self, reject: &Reject) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_rejects (id, domain, partition_key, reason_code, raw_payload, source_locator, execution_id, batch_id, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(reject.id.as_str())
        .bind(&reject.domain)
        .bind(&reject.partition_key)
        .bind(&reject.reason_code)
        .bind(&reject.raw_payload)
        .bind(&reject.source_locator)
        .bind(reject.execution_id.as_str())
        .bind(&reject.batch_id)
        .bind(reject.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_quality_check(&self, check: &QualityCheck) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_quality (domain, partition_key, check_name, category, status, actual, expected, details)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (domain, partition_key, check_name) DO UPDATE SET
                status = EXCLUDED.status, actual = EXCLUDED.actual, details = EXCLUDED.details
            "#,
        )
        .bind(&check.domain)
        .bind(&check.partition_key)
        .bind(&check.check_name)
        .bind(&check.category)
        .bind(quality_status_str(check.status))
        .bind(&check.actual)
        .bind(&check.expected)
        .bind(&check.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_anomaly(&self, anomaly: &Anomaly) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_anomalies (id, domain, partition_key, severity, category, sample_affected_records, created_at, resolved_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            "#,
        )
        .bind(anomaly.id.as_str())
        .bind(&anomaly.domain)
        .bind(&anomaly.partition_key)
        .bind(severity_str(anomaly.severity))
        .bind(&anomaly.category)
        .bind(&anomaly.sample_affected_records)
        .bind(anomaly.created_at)
        .bind(anomaly.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Acknowledge an anomaly (§6.2 `ack(anomaly_id, reason)`): stamps
    /// `resolved_at` so it drops out of [`Storage::list_unresolved_anomalies`].
    pub async fn resolve_anomaly(&self, id: &spine_types::SpineId, resolved_at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query("UPDATE core_anomalies SET resolved_at = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(resolved_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Anomalies for `domain`, newest first (§6.2 `anomalies(filter)`,
    /// simplified to a domain filter; richer filtering is left to callers
    /// post-processing this list).
    pub async fn list_anomalies(&self, domain: &str) -> Result<Vec<Anomaly>, StorageError> {
        let rows = sqlx::query_as::<_, AnomalyRow>(
            "SELECT * FROM core_anomalies WHERE domain = $1 ORDER BY created_at DESC",
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Manifest row for one `(domain, partition_key, stage)`, if the stage
    /// has reported — used by the readiness reducer's `all_stages_complete`.
    pub async fn get_manifest(&self, domain: &str, partition_key: &str, stage: &str) -> Result<Option<Manifest>, StorageError> {
        let row = sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM core_manifest WHERE domain = $1 AND partition_key = $2 AND stage = $3",
        )
        .bind(domain)
        .bind(partition_key)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Unresolved anomalies for `(domain, partition_key)`, used by the
    /// readiness reducer's `no_critical_anomalies`.
    pub async fn list_unresolved_anomalies(&self, domain: &str, partition_key: &str) -> Result<Vec<Anomaly>, StorageError> {
        let rows = sqlx::query_as::<_, AnomalyRow>(
            "SELECT * FROM core_anomalies WHERE domain = $1 AND partition_key = $2 AND resolved_at IS NULL",
        )
        .bind(domain)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// `(depends_on_domain, depends_on_ready_for)` edges for `(domain,
    /// ready_for)` — the readiness reducer's dependency graph (§3).
    pub async fn list_calc_dependencies(&self, domain: &str, ready_for: &str) -> Result<Vec<(String, String)>, StorageError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT depends_on_domain, depends_on_ready_for FROM core_calc_dependencies WHERE domain = $1 AND ready_for = $2",
        )
        .bind(domain)
        .bind(ready_for)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Expected arrival cadence for `(domain, ready_for)`, if declared —
    /// the readiness reducer's `age_exceeds_preliminary` grace window.
    pub async fn get_expected_schedule(&self, domain: &str, ready_for: &str) -> Result<Option<ExpectedSchedule>, StorageError> {
        let row = sqlx::query_as::<_, ExpectedSchedule>(
            "SELECT domain, ready_for, expected_cron, preliminary_grace_seconds FROM core_expected_schedules WHERE domain = $1 AND ready_for = $2",
        )
        .bind(domain)
        .bind(ready_for)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert_data_readiness(&self, readiness: &DataReadiness) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_data_readiness (
                domain, partition_key, ready_for, all_partitions_present, all_stages_complete,
                no_critical_anomalies, dependencies_current, age_exceeds_preliminary,
                certifier, certified_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            ON CONFLICT (domain, partition_key, ready_for) DO UPDATE SET
                all_partitions_present = EXCLUDED.all_partitions_present,
                all_stages_complete = EXCLUDED.all_stages_complete,
                no_critical_anomalies = EXCLUDED.no_critical_anomalies,
                dependencies_current = EXCLUDED.dependencies_current,
                age_exceeds_preliminary = EXCLUDED.age_exceeds_preliminary,
                certifier = EXCLUDED.certifier, certified_at = EXCLUDED.certified_at
            "#,
        )
        .bind(&readiness.domain)
        .bind(&readiness.partition_key)
        .bind(&readiness.ready_for)
        .bind(readiness.all_partitions_present)
        .bind(readiness.all_stages_complete)
        .bind(readiness.no_critical_anomalies)
        .bind(readiness.dependencies_current)
        .bind(readiness.age_exceeds_preliminary)
        .bind(&readiness.certifier)
        .bind(readiness.certified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_data_readiness(
        &self,
        domain: &str,
        partition_key: &str,
        ready_for: &str,
    ) -> Result<Option<DataReadiness>, StorageError> {
        let row = sqlx::query_as::<_, DataReadinessRow>(
            "SELECT * FROM core_data_readiness WHERE domain = $1 AND partition_key = $2 AND ready_for = $3",
        )
        .bind(domain)
        .bind(partition_key)
        .bind(ready_for)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}

#[derive(sqlx::FromRow)]
struct DataReadinessRow {
    domain: String,
    partition_key: String,
    ready_for: String,
    all_partitions_present: bool,
    all_stages_complete: bool,
    no_critical_anomalies: bool,
    dependencies_current: bool,
    age_exceeds_preliminary: bool,
    certifier: Option<String>,
    certified_at: Option<DateTime<Utc>>,
}

impl From<DataReadinessRow> for DataReadiness {
    fn from(row: DataReadinessRow) -> Self {
        DataReadiness {
            domain: row.domain,
            partition_key: row.partition_key,
            ready_for: row.ready_for,
            all_partitions_present: row.all_partitions_present,
            all_stages_complete: row.all_stages_complete,
            no_critical_anomalies: row.no_critical_anomalies,
            dependencies_current: row.dependencies_current,
            age_exceeds_preliminary: row.age_exceeds_preliminary,
            certifier: row.certifier,
            certified_at: row.certified_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ManifestRow {
    domain: String,
    partition_key: String,
    stage: String,
    row_count: i64,
    metrics: serde_json::Value,
    execution_id: String,
    batch_id: String,
    updated_at: DateTime<Utc>,
}

impl From<ManifestRow> for Manifest {
    fn from(row: ManifestRow) -> Self {
        Manifest {
            domain: row.domain,
            partition_key: row.partition_key,
            stage: row.stage,
            row_count: row.row_count as u64,
            metrics: row.metrics,
            execution_id: spine_types::SpineId::new(row.execution_id),
            batch_id: row.batch_id,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AnomalyRow {
    id: String,
    domain: String,
    partition_key: Option<String>,
    severity: String,
    category: String,
    sample_affected_records: serde_json::Value,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<AnomalyRow> for Anomaly {
    type Error = StorageError;

    fn try_from(row: AnomalyRow) -> Result<Self, StorageError> {
        let severity = match row.severity.as_str() {
            "INFO" => AlertSeverity::Info,
            "WARN" => AlertSeverity::Warn,
            "ERROR" => AlertSeverity::Error,
            "CRITICAL" => AlertSeverity::Critical,
            other => return Err(StorageError::Permanent(format!("unknown anomaly severity '{other}'"))),
        };
        Ok(Anomaly {
            id: spine_types::SpineId::new(row.id),
            domain: row.domain,
            partition_key: row.partition_key,
            severity,
            category: row.category,
            sample_affected_records: row.sample_affected_records,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

/// Row from `core_expected_schedules` (§3 `DataReadiness`).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExpectedSchedule {
    pub domain: String,
    pub ready_for: String,
    pub expected_cron: String,
    pub preliminary_grace_seconds: i64,
}
