//! Lane policy resolution (§4.3, §6.4 `dispatcher.lanes`) and alert-channel
//! selection (§4.8). Neither does I/O — both are pure functions over
//! already-loaded configuration and domain values, so the dispatcher and
//! alert bus can unit-test routing decisions without a database.

use serde::{Deserialize, Serialize};
use spine_retry::BackoffPolicy;
use spine_types::{Alert, AlertChannel, Lane};

/// Per-lane concurrency and retry policy (§6.4 `dispatcher.lanes.*`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LanePolicy {
    pub max_concurrency: u32,
    pub backoff: BackoffPolicy,
    pub timeout_ms: u64,
}

/// Resolve the policy for `lane` out of a lane table, falling back to the
/// `normal` lane's policy if the lane isn't configured — a lane with no
/// explicit entry behaves like `normal` rather than refusing to run.
pub fn resolve_lane_policy<'a>(
    lanes: &'a std::collections::BTreeMap<String, LanePolicy>,
    lane: Lane,
) -> &'a LanePolicy {
    let key = lane_key(lane);
    lanes
        .get(key)
        .or_else(|| lanes.get("normal"))
        .expect("lane table must define at least a `normal` entry")
}

pub fn lane_key(lane: Lane) -> &'static str {
    match lane {
        Lane::Normal => "normal",
        Lane::Priority => "priority",
        Lane::Backfill => "backfill",
    }
}

/// Pick every enabled channel matching `alert`, most severe `min_severity`
/// first so a caller that only wants the loudest channel can take the head
/// of the list (§4.8 channel matching).
pub fn matching_channels<'a>(channels: &'a [AlertChannel], alert: &Alert) -> Vec<&'a AlertChannel> {
    let mut matched: Vec<&AlertChannel> = channels.iter().filter(|c| c.matches(alert)).collect();
    matched.sort_by(|a, b| b.min_severity.cmp(&a.min_severity));
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use spine_types::{AlertSeverity, ChannelKind, SpineId};
    use std::collections::BTreeMap;

    fn policy(max_concurrency: u32) -> LanePolicy {
        LanePolicy {
            max_concurrency,
            backoff: BackoffPolicy::default(),
            timeout_ms: 30_000,
        }
    }

    #[test]
    fn unconfigured_lane_falls_back_to_normal() {
        let mut lanes = BTreeMap::new();
        lanes.insert("normal".to_string(), policy(4));
        let resolved = resolve_lane_policy(&lanes, Lane::Priority);
        assert_eq!(resolved.max_concurrency, 4);
    }

    #[test]
    fn configured_lane_wins_over_fallback() {
        let mut lanes = BTreeMap::new();
        lanes.insert("normal".to_string(), policy(4));
        lanes.insert("priority".to_string(), policy(1));
        let resolved = resolve_lane_policy(&lanes, Lane::Priority);
        assert_eq!(resolved.max_concurrency, 1);
    }

    fn channel(name: &str, min_severity: AlertSeverity, domains: &[&str]) -> AlertChannel {
        AlertChannel {
            name: name.to_string(),
            min_severity,
            domains: domains.iter().map(|s| s.to_string()).collect(),
            enabled: true,
            throttle_minutes: 15,
            consecutive_failures: 0,
            kind: ChannelKind::Log,
        }
    }

    #[test]
    fn matching_channels_filters_by_severity_and_domain_and_orders_loudest_first() {
        let channels = vec![
            channel("quiet", AlertSeverity::Info, &[]),
            channel("loud", AlertSeverity::Critical, &[]),
            channel("scoped", AlertSeverity::Warn, &["other.domain"]),
        ];
        let alert = Alert {
            id: SpineId::new("a1"),
            severity: AlertSeverity::Error,
            title: "t".to_string(),
            message: "m".to_string(),
            source: "s".to_string(),
            domain: Some("finra.otc".to_string()),
            dedup_key: None,
            metadata: json!({}),
            created_at: Utc::now(),
        };
        let matched = matching_channels(&channels, &alert);
        let names: Vec<&str> = matched.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["loud", "quiet"]);
    }
}
