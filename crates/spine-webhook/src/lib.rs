//! Webhook transport for the Alert Bus (§4.8 `ChannelKind::Webhook`).
//!
//! One HTTP POST per delivery attempt; the Alert Bus owns retry scheduling
//! (via `spine-retry`) and only calls [`deliver`] once per attempt. A
//! channel-scoped `secret` signs the body with HMAC-SHA256 so receivers can
//! verify the request came from this process.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> Result<(), spine_webhook::WebhookError> {
//! use spine_webhook::{deliver, WebhookConfig};
//! use spine_types::{Alert, AlertSeverity, SpineId};
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let config = WebhookConfig {
//!     url: "https://hooks.example.com/spine".to_string(),
//!     secret: None,
//!     timeout_secs: 10,
//! };
//! let alert = Alert {
//!     id: SpineId::new("alert-1"),
//!     severity: AlertSeverity::Error,
//!     title: "ingest failed".to_string(),
//!     message: "3 consecutive failures".to_string(),
//!     source: "dispatcher".to_string(),
//!     domain: Some("finra.otc_transparency".to_string()),
//!     dedup_key: None,
//!     metadata: json!({}),
//!     created_at: Utc::now(),
//! };
//! deliver(&config, &alert).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use spine_types::Alert;

type HmacSha256 = Hmac<Sha256>;

fn default_timeout() -> u64 {
    30
}

/// Channel-scoped delivery settings (§3 `AlertChannel.kind = Webhook`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// When set, the request body is signed with HMAC-SHA256 and carried in
    /// the `X-Spine-Signature` header as a hex digest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: None,
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("webhook request failed: {0}")]
    Request(String),
    #[error("webhook endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// The JSON body posted to a webhook channel. Flat and generic — unlike the
/// donor's Slack/Discord-specific formatters, every webhook channel in the
/// alert bus gets the same envelope; richer formatting is a receiver
/// concern, not this crate's.
#[derive(Debug, Clone, Serialize)]
struct AlertPayload<'a> {
    severity: spine_types::AlertSeverity,
    title: &'a str,
    message: &'a str,
    source: &'a str,
    domain: Option<&'a str>,
    created_at: chrono::DateTime<chrono::Utc>,
    metadata: &'a serde_json::Value,
}

fn alert_payload(alert: &Alert) -> AlertPayload<'_> {
    AlertPayload {
        severity: alert.severity,
        title: &alert.title,
        message: &alert.message,
        source: &alert.source,
        domain: alert.domain.as_deref(),
        created_at: alert.created_at,
        metadata: &alert.metadata,
    }
}

fn sign(secret: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Send one alert to one webhook channel. A non-2xx response or transport
/// error is returned to the caller uninterpreted — the Alert Bus classifies
/// it for retry purposes (§4.8).
pub async fn deliver(config: &WebhookConfig, alert: &Alert) -> Result<(), WebhookError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| WebhookError::Client(e.to_string()))?;

    let payload = alert_payload(alert);
    let body = serde_json::to_string(&payload).expect("alert payload always serializes");

    let mut request = client
        .post(&config.url)
        .header("Content-Type", "application/json");
    if let Some(secret) = &config.secret {
        request = request.header("X-Spine-Signature", sign(secret, &body));
    }

    let response = request
        .body(body)
        .send()
        .await
        .map_err(|e| WebhookError::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(WebhookError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use spine_types::{AlertSeverity, SpineId};

    fn sample_alert() -> Alert {
        Alert {
            id: SpineId::new("alert-1"),
            severity: AlertSeverity::Error,
            title: "ingest failed".to_string(),
            message: "3 consecutive failures".to_string(),
            source: "dispatcher".to_string(),
            domain: Some("finra.otc_transparency".to_string()),
            dedup_key: None,
            metadata: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn webhook_config_defaults() {
        let config = WebhookConfig::default();
        assert!(config.url.is_empty());
        assert_eq!(config.timeout_secs, 30);
        assert!(config.secret.is_none());
    }

    #[test]
    fn alert_payload_carries_fields() {
        let alert = sample_alert();
        let payload = alert_payload(&alert);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"title\":\"ingest failed\""));
        assert!(json.contains("\"severity\":\"ERROR\""));
        assert!(json.contains("finra.otc_transparency"));
    }

    #[test]
    fn signature_is_deterministic_per_secret() {
        let body = r#"{"title":"x"}"#;
        let a = sign("secret-a", body);
        let b = sign("secret-a", body);
        let c = sign("secret-b", body);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn deliver_posts_signed_body_and_succeeds_on_2xx() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind test server");
        let addr = server.server_addr();
        let config = WebhookConfig {
            url: format!("http://{addr}/hook"),
            secret: Some("shh".to_string()),
            timeout_secs: 5,
        };
        let alert = sample_alert();

        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("receive request");
            let signature = request
                .headers()
                .iter()
                .find(|h| h.field.equiv("X-Spine-Signature"))
                .map(|h| h.value.as_str().to_string());
            assert!(signature.is_some());
            request
                .respond(tiny_http::Response::from_string("ok"))
                .expect("respond");
        });

        deliver(&config, &alert).await.expect("delivery succeeds");
        handle.join().expect("server thread completes");
    }
}
