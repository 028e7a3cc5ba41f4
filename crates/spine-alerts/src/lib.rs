//! Alert bus (§4.8): severity/domain routing over [`spine_policy`], dedup
//! and throttle via `spine-storage`'s `core_alert_throttle`, delivery retry
//! timing from [`spine_retry`], and transport per channel kind (webhook via
//! [`spine_webhook`], log channels via `tracing`).

mod error;

pub use error::AlertsError;

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use spine_policy::matching_channels;
use spine_retry::BackoffPolicy;
use spine_storage::Storage;
use spine_types::{Alert, AlertChannel, AlertDelivery, AlertSeverity, ChannelKind, DeliveryStatus, SpineId};
use spine_webhook::WebhookConfig;
use tracing::{info, warn};
use uuid::Uuid;

fn new_id() -> SpineId {
    SpineId::new(Uuid::new_v4().to_string())
}

#[derive(Debug, Default)]
pub struct PublishReport {
    pub delivered: u32,
    pub suppressed: u32,
    pub failed: u32,
}

/// Route `alert` to every enabled channel it matches, check-and-set the
/// per-`(dedup_key, channel)` throttle, and attempt one delivery per
/// surviving channel (§4.8). `webhook_configs` resolves a webhook channel's
/// name to its URL/secret/timeout; a channel with `ChannelKind::Webhook` and
/// no entry there is treated as misconfigured and logged, not delivered.
#[tracing::instrument(skip(storage, channels, backoff, webhook_configs), fields(alert_id = %alert.id))]
pub async fn publish(
    storage: &Storage,
    channels: &[AlertChannel],
    alert: &Alert,
    backoff: &BackoffPolicy,
    auto_disable_threshold: u32,
    webhook_configs: &HashMap<String, WebhookConfig>,
) -> Result<PublishReport, AlertsError> {
    storage.insert_alert(alert).await?;
    let mut report = PublishReport::default();
    for channel in matching_channels(channels, alert) {
        let dedup_key = alert.dedup_key.clone().unwrap_or_else(|| alert.id.to_string());
        let now = Utc::now();
        let expires_at = now + ChronoDuration::minutes(channel.throttle_minutes);
        let suppressed = storage.check_and_throttle(&dedup_key, &channel.name, now, expires_at).await?;
        if suppressed {
            record_delivery(storage, &alert.id, &channel.name, 1, DeliveryStatus::Suppressed, None, None, None).await?;
            report.suppressed += 1;
            continue;
        }
        match attempt_delivery(channel, alert, webhook_configs).await {
            Ok(()) => {
                record_delivery(storage, &alert.id, &channel.name, 1, DeliveryStatus::Delivered, Some(now), None, None).await?;
                storage.reset_channel_failures(&channel.name).await?;
                info!(channel = %channel.name, "alert delivered");
                report.delivered += 1;
            }
            Err(message) => {
                let next_retry_at = now + ChronoDuration::from_std(backoff.delay_for(0).with_jitter()).unwrap_or_default();
                record_delivery(storage, &alert.id, &channel.name, 1, DeliveryStatus::Failed, None, Some(message.clone()), Some(next_retry_at)).await?;
                let failures = storage.bump_channel_failures(&channel.name, auto_disable_threshold).await?;
                if failures >= auto_disable_threshold {
                    warn!(channel = %channel.name, failures, "channel auto-disabled after consecutive failures");
                } else {
                    warn!(channel = %channel.name, error = %message, next_retry_at = %next_retry_at, "alert delivery failed, will retry");
                }
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Re-attempt one previously failed delivery, honoring its existing attempt
/// count when deciding whether this was the last chance before the channel
/// auto-disables.
#[tracing::instrument(skip(storage, channel, alert, backoff, webhook_configs))]
pub async fn redeliver(
    storage: &Storage,
    channel: &AlertChannel,
    alert: &Alert,
    previous_attempt: u32,
    backoff: &BackoffPolicy,
    auto_disable_threshold: u32,
    webhook_configs: &HashMap<String, WebhookConfig>,
) -> Result<DeliveryStatus, AlertsError> {
    let attempt = previous_attempt + 1;
    match attempt_delivery(channel, alert, webhook_configs).await {
        Ok(()) => {
            record_delivery(storage, &alert.id, &channel.name, attempt, DeliveryStatus::Delivered, Some(Utc::now()), None, None).await?;
            storage.reset_channel_failures(&channel.name).await?;
            Ok(DeliveryStatus::Delivered)
        }
        Err(message) => {
            let next_retry_at = if backoff.exhausted(attempt) {
                None
            } else {
                Some(Utc::now() + ChronoDuration::from_std(backoff.delay_for(attempt).with_jitter()).unwrap_or_default())
            };
            record_delivery(storage, &alert.id, &channel.name, attempt, DeliveryStatus::Failed, None, Some(message), next_retry_at).await?;
            storage.bump_channel_failures(&channel.name, auto_disable_threshold).await?;
            Ok(DeliveryStatus::Failed)
        }
    }
}

async fn attempt_delivery(channel: &AlertChannel, alert: &Alert, webhook_configs: &HashMap<String, WebhookConfig>) -> Result<(), String> {
    match &channel.kind {
        ChannelKind::Log => {
            log_alert(alert);
            Ok(())
        }
        ChannelKind::Webhook { url } => {
            let config = webhook_configs.get(&channel.name).cloned().unwrap_or(WebhookConfig {
                url: url.clone(),
                secret: None,
                timeout_secs: 30,
            });
            spine_webhook::deliver(&config, alert).await.map_err(|e| e.to_string())
        }
    }
}

fn log_alert(alert: &Alert) {
    match alert.severity {
        AlertSeverity::Critical | AlertSeverity::Error => {
            tracing::error!(alert_id = %alert.id, domain = ?alert.domain, "{}: {}", alert.title, alert.message)
        }
        AlertSeverity::Warn => tracing::warn!(alert_id = %alert.id, domain = ?alert.domain, "{}: {}", alert.title, alert.message),
        AlertSeverity::Info => tracing::info!(alert_id = %alert.id, domain = ?alert.domain, "{}: {}", alert.title, alert.message),
    }
}

async fn record_delivery(
    storage: &Storage,
    alert_id: &SpineId,
    channel_name: &str,
    attempt: u32,
    status: DeliveryStatus,
    delivered_at: Option<chrono::DateTime<Utc>>,
    error: Option<String>,
    next_retry_at: Option<chrono::DateTime<Utc>>,
) -> Result<(), AlertsError> {
    storage
        .record_delivery(&AlertDelivery {
            id: new_id(),
            alert_id: alert_id.clone(),
            channel_name: channel_name.to_string(),
            attempt,
            status,
            next_retry_at,
            delivered_at,
            error,
        })
        .await?;
    Ok(())
}
