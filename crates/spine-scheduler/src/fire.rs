//! Pure fire-time arithmetic for schedule evaluation (§4.6), kept separate
//! from storage/locking so the coalescing and grace-window rules can be unit
//! tested against fixed timestamps rather than `Utc::now()`.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use spine_types::{Schedule, ScheduleType};

use crate::error::SchedulerError;

/// The fire-times due in `(after, now]`. `after` is `None` the first time a
/// schedule ever evaluates, in which case only `now` itself is due — nothing
/// retroactive gets replayed for a brand new schedule.
pub fn due_fire_times(schedule: &Schedule, after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    match schedule.schedule_type {
        ScheduleType::Cron => cron_fire_times(schedule, after, now),
        ScheduleType::Interval => interval_fire_times(schedule, after, now),
        ScheduleType::At => at_fire_time(schedule, after, now),
    }
}

fn parse_tz(schedule: &Schedule) -> Result<Tz, SchedulerError> {
    Tz::from_str(&schedule.timezone).map_err(|_| SchedulerError::InvalidTimezone(schedule.timezone.clone()))
}

fn cron_fire_times(schedule: &Schedule, after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    let cron_schedule = cron::Schedule::from_str(&schedule.expression).map_err(|source| SchedulerError::InvalidCron {
        expression: schedule.expression.clone(),
        source,
    })?;
    let tz = parse_tz(schedule)?;
    let start = after.unwrap_or(now).with_timezone(&tz);
    let now_tz = now.with_timezone(&tz);
    Ok(cron_schedule
        .after(&start)
        .take_while(|t| *t <= now_tz)
        .map(|t| t.with_timezone(&Utc))
        .collect())
}

fn interval_fire_times(schedule: &Schedule, after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    let seconds: i64 = schedule
        .expression
        .parse()
        .map_err(|_| SchedulerError::InvalidInterval(schedule.expression.clone()))?;
    if seconds <= 0 {
        return Err(SchedulerError::InvalidInterval(schedule.expression.clone()));
    }
    let interval = Duration::seconds(seconds);
    let mut fires = Vec::new();
    let mut next = after.map(|a| a + interval).unwrap_or(now);
    while next <= now {
        fires.push(next);
        next += interval;
    }
    Ok(fires)
}

fn at_fire_time(schedule: &Schedule, after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, SchedulerError> {
    if after.is_some() {
        // one-shot schedules disable themselves after firing once (§4.6e).
        return Ok(Vec::new());
    }
    let instant = DateTime::parse_from_rfc3339(&schedule.expression)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| SchedulerError::InvalidAt(schedule.expression.clone()))?;
    Ok(if instant <= now { vec![instant] } else { Vec::new() })
}

/// When `max_instances == 1` and more than one fire-time is due, keep only
/// the latest and report the rest as coalesced (§4.6b).
pub fn coalesce(mut fire_times: Vec<DateTime<Utc>>, max_instances: u32) -> (Vec<DateTime<Utc>>, Vec<DateTime<Utc>>) {
    if max_instances != 1 || fire_times.len() <= 1 {
        return (fire_times, Vec::new());
    }
    fire_times.sort();
    let latest = fire_times.pop().expect("len > 1 checked above");
    (vec![latest], fire_times)
}

/// Whether `fire_time` is still within its misfire grace window at `now`.
pub fn within_grace(fire_time: DateTime<Utc>, now: DateTime<Utc>, misfire_grace_seconds: i64) -> bool {
    (now - fire_time) <= Duration::seconds(misfire_grace_seconds)
}

/// The schedule's next `next_run_at`, strictly greater than `now` (or the
/// latest processed fire-time for `at`, which never fires again).
pub fn compute_next_run_at(
    schedule: &Schedule,
    latest_fire_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    match schedule.schedule_type {
        ScheduleType::Cron => {
            let cron_schedule = cron::Schedule::from_str(&schedule.expression).map_err(|source| SchedulerError::InvalidCron {
                expression: schedule.expression.clone(),
                source,
            })?;
            let tz = parse_tz(schedule)?;
            let start = now.max(latest_fire_time).with_timezone(&tz);
            Ok(cron_schedule.after(&start).next().map(|t| t.with_timezone(&Utc)))
        }
        ScheduleType::Interval => {
            let seconds: i64 = schedule
                .expression
                .parse()
                .map_err(|_| SchedulerError::InvalidInterval(schedule.expression.clone()))?;
            let mut next = latest_fire_time + Duration::seconds(seconds);
            while next <= now {
                next += Duration::seconds(seconds);
            }
            Ok(Some(next))
        }
        ScheduleType::At => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spine_types::ScheduleTarget;

    fn schedule(schedule_type: ScheduleType, expression: &str, max_instances: u32) -> Schedule {
        Schedule {
            name: "test".to_string(),
            target: ScheduleTarget::Pipeline { name: "p".to_string() },
            params: serde_json::json!({}),
            schedule_type,
            expression: expression.to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
            max_instances,
            misfire_grace_seconds: 300,
            next_run_at: None,
            last_run_at: None,
            last_run_status: None,
            version: 1,
        }
    }

    #[test]
    fn interval_fire_times_are_spaced_by_interval() {
        let s = schedule(ScheduleType::Interval, "60", 5);
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 3, 30).unwrap();
        let fires = interval_fire_times(&s, Some(after), now).unwrap();
        assert_eq!(fires.len(), 3);
        assert_eq!(fires[0], after + Duration::seconds(60));
    }

    #[test]
    fn coalesce_keeps_only_latest_when_max_instances_one() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 2, 0).unwrap();
        let (kept, dropped) = coalesce(vec![t1, t2, t3], 1);
        assert_eq!(kept, vec![t3]);
        assert_eq!(dropped, vec![t1, t2]);
    }

    #[test]
    fn coalesce_is_noop_when_max_instances_above_one() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap();
        let (kept, dropped) = coalesce(vec![t1, t2], 5);
        assert_eq!(kept, vec![t1, t2]);
        assert!(dropped.is_empty());
    }

    #[test]
    fn within_grace_respects_the_boundary() {
        let fire = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(within_grace(fire, fire + Duration::seconds(300), 300));
        assert!(!within_grace(fire, fire + Duration::seconds(301), 300));
    }

    #[test]
    fn at_schedule_fires_once_then_never_again() {
        let mut s = schedule(ScheduleType::At, "2026-01-01T00:00:00Z", 1);
        s.expression = "2026-01-01T00:00:00Z".to_string();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap();
        let first = at_fire_time(&s, None, now).unwrap();
        assert_eq!(first.len(), 1);
        let second = at_fire_time(&s, Some(first[0]), now).unwrap();
        assert!(second.is_empty());
    }
}
