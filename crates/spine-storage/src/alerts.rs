//! `core_alert_channels`, `core_alerts`, `core_alert_deliveries`,
//! `core_alert_throttle` (§6.3, §4.8).

use chrono::{DateTime, Utc};
use spine_types::{
    Alert, AlertChannel, AlertDelivery, AlertSeverity, AlertThrottle, ChannelKind, DeliveryStatus, SpineId,
};

use crate::error::StorageError;
use crate::pool::Storage;

fn severity_str(s: AlertSeverity) -> &'static str {
    match s {
        AlertSeverity::Info => "INFO",
        AlertSeverity::Warn => "WARN",
        AlertSeverity::Error => "ERROR",
        AlertSeverity::Critical => "CRITICAL",
    }
}

fn severity_from_str(s: &str) -> AlertSeverity {
    match s {
        "WARN" => AlertSeverity::Warn,
        "ERROR" => AlertSeverity::Error,
        "CRITICAL" => AlertSeverity::Critical,
        _ => AlertSeverity::Info,
    }
}

fn delivery_status_str(s: DeliveryStatus) -> &'static str {
    match s {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Failed => "failed",
        DeliveryStatus::Suppressed => "suppressed",
    }
}

impl Storage {
    pub async fn list_alert_channels(&self) -> Result<Vec<AlertChannel>, StorageError> {
        let rows = sqlx::query_as::<_, ChannelRow>("SELECT * FROM core_alert_channels ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn insert_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_alerts (id, severity, title, message, source, domain, dedup_key, metadata, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(alert.id.as_str())
        .bind(severity_str(alert.severity))
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.source)
        .bind(&alert.domain)
        .bind(&alert.dedup_key)
        .bind(&alert.metadata)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_delivery(&self, delivery: &AlertDelivery) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO core_alert_deliveries (id, alert_id, channel_name, attempt, status, next_retry_at, delivered_at, error)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status, next_retry_at = EXCLUDED.next_retry_at,
                delivered_at = EXCLUDED.delivered_at, error = EXCLUDED.error
            "#,
        )
        .bind(delivery.id.as_str())
        .bind(delivery.alert_id.as_str())
        .bind(&delivery.channel_name)
        .bind(delivery.attempt as i64)
        .bind(delivery_status_str(delivery.status))
        .bind(delivery.next_retry_at)
        .bind(delivery.delivered_at)
        .bind(&delivery.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// CAS-style failure counter used to auto-disable a channel after
    /// `threshold` consecutive delivery failures (§4.8). Returns the new
    /// count.
    pub async fn bump_channel_failures(&self, channel_name: &str, threshold: u32) -> Result<u32, StorageError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            UPDATE core_alert_channels SET
                consecutive_failures = consecutive_failures + 1,
                enabled = CASE WHEN consecutive_failures + 1 >= $2 THEN false ELSE enabled END
            WHERE name = $1
            RETURNING consecutive_failures
            "#,
        )
        .bind(channel_name)
        .bind(threshold as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    pub async fn reset_channel_failures(&self, channel_name: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE core_alert_channels SET consecutive_failures = 0 WHERE name = $1")
            .bind(channel_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Throttle check-and-set in one round trip: if an unexpired throttle
    /// entry exists for `dedup_key`, bump `send_count` and report suppressed;
    /// otherwise insert a fresh entry and report not-suppressed (§4.8).
    pub async fn check_and_throttle(
        &self,
        dedup_key: &str,
        channel_name: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_as::<_, (DateTime<Utc>,)>(
            "SELECT expires_at FROM core_alert_throttle WHERE dedup_key = $1 AND channel_name = $2 FOR UPDATE",
        )
        .bind(dedup_key)
        .bind(channel_name)
        .fetch_optional(&mut *tx)
        .await?;

        let suppressed = match existing {
            Some((expires,)) if expires > now => {
                sqlx::query(
                    "UPDATE core_alert_throttle SET send_count = send_count + 1 WHERE dedup_key = $1 AND channel_name = $2",
                )
                .bind(dedup_key)
                .bind(channel_name)
                .execute(&mut *tx)
                .await?;
                true
            }
            _ => {
                sqlx::query(
                    r#"
                    INSERT INTO core_alert_throttle (dedup_key, channel_name, last_sent_at, send_count, expires_at)
                    VALUES ($1,$2,$3,1,$4)
                    ON CONFLICT (dedup_key, channel_name) DO UPDATE SET
                        last_sent_at = EXCLUDED.last_sent_at, send_count = 1, expires_at = EXCLUDED.expires_at
                    "#,
                )
                .bind(dedup_key)
                .bind(channel_name)
                .bind(now)
                .bind(expires_at)
                .execute(&mut *tx)
                .await?;
                false
            }
        };
        tx.commit().await?;
        Ok(suppressed)
    }
}

#[derive(sqlx::FromRow)]
struct ChannelRow {
    name: String,
    min_severity: String,
    domains: Vec<String>,
    enabled: bool,
    throttle_minutes: i64,
    consecutive_failures: i64,
    kind: String,
    webhook_url: Option<String>,
}

impl From<ChannelRow> for AlertChannel {
    fn from(row: ChannelRow) -> Self {
        AlertChannel {
            name: row.name,
            min_severity: severity_from_str(&row.min_severity),
            domains: row.domains,
            enabled: row.enabled,
            throttle_minutes: row.throttle_minutes,
            consecutive_failures: row.consecutive_failures as u32,
            kind: match row.kind.as_str() {
                "webhook" => ChannelKind::Webhook {
                    url: row.webhook_url.unwrap_or_default(),
                },
                _ => ChannelKind::Log,
            },
        }
    }
}
