use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SpineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// Delivery target for alerts (§4.8). A channel matches an alert iff
/// `severity >= channel.min_severity` and (`domains` empty or contains the
/// alert's domain) and `enabled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub name: String,
    pub min_severity: AlertSeverity,
    pub domains: Vec<String>,
    pub enabled: bool,
    pub throttle_minutes: i64,
    pub consecutive_failures: u32,
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelKind {
    Webhook { url: String },
    Log,
}

impl AlertChannel {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.enabled
            && alert.severity >= self.min_severity
            && (self.domains.is_empty()
                || alert
                    .domain
                    .as_deref()
                    .is_some_and(|d| self.domains.iter().any(|c| c == d)))
    }
}

/// A severity-tagged event fed into the Alert Bus by the dispatcher,
/// quality pipeline, scheduler, or readiness reducer (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: SpineId,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub source: String,
    pub domain: Option<String>,
    pub dedup_key: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Suppressed,
}

/// One `(alert, channel, attempt)` delivery record (§4.8, §8.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDelivery {
    pub id: SpineId,
    pub alert_id: SpineId,
    pub channel_name: String,
    pub attempt: u32,
    pub status: DeliveryStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Throttle state keyed by `dedup_key` (§4.8). A new alert arriving within
/// `channel.throttle_minutes` of `last_sent_at` is suppressed but counted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThrottle {
    pub dedup_key: String,
    pub channel_name: String,
    pub last_sent_at: DateTime<Utc>,
    pub send_count: u64,
    pub expires_at: DateTime<Utc>,
}
