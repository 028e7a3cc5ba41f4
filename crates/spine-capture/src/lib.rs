//! Capture Service (§2.5, §3): mints `capture_id`s, records
//! manifest/rejects/quality/anomalies, and maintains `DataReadiness` by
//! reducing over manifest + anomalies + the dependency graph in
//! `core_calc_dependencies`/`core_expected_schedules`.
//!
//! This is the one component allowed to write the manifest/rejects/quality/
//! anomalies tables; everything else treats them as read-only.

mod error;

pub use error::CaptureError;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use spine_storage::Storage;
use spine_types::{AlertSeverity, Anomaly, CaptureId, DataReadiness, Manifest, QualityCheck, QualityStatus, Reject, SpineId};
use tracing::{info, warn};

/// `domain:tier:partition:hash` (§3 `CaptureId`). `hash` is the leading
/// hex of SHA-256 over `captured_at`'s RFC3339 form, truncated to
/// `hash_hex_len` (default 6; §11.3 `timestamp_hash.algo`).
pub fn mint_capture_id(domain: &str, tier: &str, partition_key: &str, captured_at: DateTime<Utc>, separator: &str, hash_hex_len: usize) -> CaptureId {
    let digest = Sha256::digest(captured_at.to_rfc3339().as_bytes());
    let hash = &hex::encode(digest)[..hash_hex_len.min(64)];
    CaptureId::new(domain, tier, partition_key, hash, separator)
}

/// Report one `(domain, partition_key, stage)` production (§2.5). Idempotent
/// on retry — a re-reported stage overwrites its own row, never duplicates.
#[tracing::instrument(skip(storage, metrics))]
pub async fn record_manifest(
    storage: &Storage,
    domain: &str,
    partition_key: &str,
    stage: &str,
    row_count: u64,
    metrics: Value,
    execution_id: SpineId,
    batch_id: &str,
) -> Result<(), CaptureError> {
    storage
        .upsert_manifest(&Manifest {
            domain: domain.to_string(),
            partition_key: partition_key.to_string(),
            stage: stage.to_string(),
            row_count,
            metrics,
            execution_id,
            batch_id: batch_id.to_string(),
            updated_at: Utc::now(),
        })
        .await?;
    info!(domain, partition_key, stage, row_count, "manifest recorded");
    Ok(())
}

/// Record one bad input record (§3 `Reject`).
#[tracing::instrument(skip(storage, raw_payload))]
pub async fn record_reject(
    storage: &Storage,
    id: SpineId,
    domain: &str,
    partition_key: &str,
    reason_code: &str,
    raw_payload: Value,
    source_locator: &str,
    execution_id: SpineId,
    batch_id: &str,
) -> Result<(), CaptureError> {
    storage
        .insert_reject(&Reject {
            id,
            domain: domain.to_string(),
            partition_key: partition_key.to_string(),
            reason_code: reason_code.to_string(),
            raw_payload,
            source_locator: source_locator.to_string(),
            execution_id,
            batch_id: batch_id.to_string(),
            created_at: Utc::now(),
        })
        .await?;
    Ok(())
}

/// Record or update one named quality check's latest outcome (§3
/// `QualityCheck`).
#[tracing::instrument(skip(storage, actual, expected))]
pub async fn record_quality_check(
    storage: &Storage,
    domain: &str,
    partition_key: &str,
    check_name: &str,
    category: &str,
    status: QualityStatus,
    actual: Value,
    expected: Value,
    details: Option<String>,
) -> Result<(), CaptureError> {
    storage
        .insert_quality_check(&QualityCheck {
            domain: domain.to_string(),
            partition_key: partition_key.to_string(),
            check_name: check_name.to_string(),
            category: category.to_string(),
            status,
            actual,
            expected,
            details,
        })
        .await?;
    if status == QualityStatus::Fail {
        warn!(domain, partition_key, check_name, "quality check failed");
    }
    Ok(())
}

/// Record a detected deviation (§3 `Anomaly`).
#[tracing::instrument(skip(storage, sample_affected_records))]
pub async fn record_anomaly(
    storage: &Storage,
    id: SpineId,
    domain: &str,
    partition_key: Option<String>,
    severity: AlertSeverity,
    category: &str,
    sample_affected_records: Value,
) -> Result<(), CaptureError> {
    storage
        .insert_anomaly(&Anomaly {
            id,
            domain: domain.to_string(),
            partition_key,
            severity,
            category: category.to_string(),
            sample_affected_records,
            created_at: Utc::now(),
            resolved_at: None,
        })
        .await?;
    match severity {
        AlertSeverity::Error | AlertSeverity::Critical => warn!(domain, category, "anomaly recorded"),
        _ => info!(domain, category, "anomaly recorded"),
    }
    Ok(())
}

/// A caller-supplied manual block (§6.2 `block(partition, reason)`), raised
/// as a `Critical` anomaly so the readiness reducer's `no_critical_anomalies`
/// picks it up on the next recompute.
#[tracing::instrument(skip(storage))]
pub async fn block(storage: &Storage, id: SpineId, domain: &str, partition_key: &str, reason: &str) -> Result<(), CaptureError> {
    record_anomaly(
        storage,
        id,
        domain,
        Some(partition_key.to_string()),
        AlertSeverity::Critical,
        "manual_block",
        serde_json::json!({ "reason": reason }),
    )
    .await
}

/// Attach a certification note (§6.2 `certify(partition, note)`). Does not
/// by itself flip `is_ready`; the next [`recompute_readiness`] still checks
/// every structural condition, but `certifier`/`certified_at` are preserved
/// through future recomputes once set.
#[tracing::instrument(skip(storage))]
pub async fn certify(storage: &Storage, domain: &str, partition_key: &str, ready_for: &str, note: &str) -> Result<DataReadiness, CaptureError> {
    let mut readiness = storage
        .get_data_readiness(domain, partition_key, ready_for)
        .await?
        .unwrap_or_else(|| blank_readiness(domain, partition_key, ready_for));
    readiness.certifier = Some(note.to_string());
    readiness.certified_at = Some(Utc::now());
    storage.upsert_data_readiness(&readiness).await?;
    Ok(readiness)
}

fn blank_readiness(domain: &str, partition_key: &str, ready_for: &str) -> DataReadiness {
    DataReadiness {
        domain: domain.to_string(),
        partition_key: partition_key.to_string(),
        ready_for: ready_for.to_string(),
        all_partitions_present: false,
        all_stages_complete: false,
        no_critical_anomalies: true,
        dependencies_current: false,
        age_exceeds_preliminary: false,
        certifier: None,
        certified_at: None,
    }
}

/// Recompute `DataReadiness` for `(domain, partition_key, ready_for)` over
/// manifest + anomalies + the dependency graph (§3). `required_stages` is
/// every stage that must have a manifest row at `partition_key` for
/// `all_stages_complete`; `expected_partition_keys` is the full partition
/// set (e.g. a week's worth of daily partitions) checked against
/// `primary_stage` for `all_partitions_present`.
///
/// `age_exceeds_preliminary` is derived from elapsed time since the
/// `primary_stage` manifest's `updated_at` versus `core_expected_schedules`'
/// `preliminary_grace_seconds` — a simplification that skips evaluating the
/// declared `expected_cron` itself, since that requires modeling expected
/// *input* arrival rather than output production.
#[tracing::instrument(skip(storage, required_stages, expected_partition_keys))]
pub async fn recompute_readiness(
    storage: &Storage,
    domain: &str,
    partition_key: &str,
    ready_for: &str,
    primary_stage: &str,
    required_stages: &[String],
    expected_partition_keys: &[String],
) -> Result<DataReadiness, CaptureError> {
    let now = Utc::now();
    let previous = storage.get_data_readiness(domain, partition_key, ready_for).await?;

    let mut all_stages_complete = true;
    let mut primary_manifest = None;
    for stage in required_stages {
        let manifest = storage.get_manifest(domain, partition_key, stage).await?;
        if stage == primary_stage {
            primary_manifest = manifest.clone();
        }
        if manifest.is_none() {
            all_stages_complete = false;
        }
    }

    let mut all_partitions_present = true;
    for key in expected_partition_keys {
        if storage.get_manifest(domain, key, primary_stage).await?.is_none() {
            all_partitions_present = false;
            break;
        }
    }

    let unresolved = storage.list_unresolved_anomalies(domain, partition_key).await?;
    let no_critical_anomalies = unresolved.iter().all(|a| a.severity < AlertSeverity::Error);

    let dependencies = storage.list_calc_dependencies(domain, ready_for).await?;
    let mut dependencies_current = true;
    for (dep_domain, dep_ready_for) in &dependencies {
        match storage.get_data_readiness(dep_domain, partition_key, dep_ready_for).await? {
            Some(dep) if dep.is_ready() => {}
            _ => {
                dependencies_current = false;
                break;
            }
        }
    }

    let schedule = storage.get_expected_schedule(domain, ready_for).await?;
    let age_exceeds_preliminary = match (&primary_manifest, &schedule) {
        (Some(manifest), Some(sched)) => now.signed_duration_since(manifest.updated_at).num_seconds() > sched.preliminary_grace_seconds,
        _ => false,
    };

    let readiness = DataReadiness {
        domain: domain.to_string(),
        partition_key: partition_key.to_string(),
        ready_for: ready_for.to_string(),
        all_partitions_present,
        all_stages_complete,
        no_critical_anomalies,
        dependencies_current,
        age_exceeds_preliminary,
        certifier: previous.as_ref().and_then(|p| p.certifier.clone()),
        certified_at: previous.as_ref().and_then(|p| p.certified_at),
    };
    storage.upsert_data_readiness(&readiness).await?;
    info!(domain, partition_key, ready_for, is_ready = readiness.is_ready(), "readiness recomputed");
    Ok(readiness)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_id_is_stable_for_the_same_timestamp() {
        let ts = Utc::now();
        let a = mint_capture_id("md", "t1", "2024-W01", ts, ":", 6);
        let b = mint_capture_id("md", "t1", "2024-W01", ts, ":", 6);
        assert_eq!(a, b);
        assert_eq!(a.0.matches(':').count(), 3);
    }

    #[test]
    fn capture_id_changes_with_tier_and_partition() {
        let ts = Utc::now();
        let a = mint_capture_id("md", "t1", "2024-W01", ts, ":", 6);
        let b = mint_capture_id("md", "t2", "2024-W01", ts, ":", 6);
        assert_ne!(a, b);
    }
}
