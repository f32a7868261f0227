//! Schedule resolution: turning a job's descriptor into its next firing
//! instant.
//!
//! One-shot jobs carry `{"execute_at": "<RFC3339 millis>" | "now"}`;
//! recurring jobs carry a standard 5-field cron expression that is
//! evaluated in the process's local time zone.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::models::{IntervalSpec, Job, JobType, ScheduleSpec};

/// The exact timestamp format accepted for `execute_at`.
const EXECUTE_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Grace applied when a job asks to run `"now"`, so the insert commits
/// before the firing becomes due.
const NOW_GRACE_SECONDS: i64 = 2;

/// Why a schedule descriptor could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The descriptor is missing, malformed, or does not match the job type.
    #[error("invalid schedule descriptor: {0}")]
    InvalidDescriptor(String),
    /// The requested one-shot instant already passed.
    #[error("scheduled time cannot be in the past: {0}")]
    PastInstant(DateTime<Utc>),
    /// The cron expression does not parse or never fires again.
    #[error("unparsable cron expression: {0}")]
    UnparsableCron(String),
}

/// Compute the next firing instant for `job`, strictly after now
/// (except for `execute_at == "now"`, which fires after a short grace).
pub fn compute_next(job: &Job) -> Result<DateTime<Utc>, ScheduleError> {
    compute_next_at(job, Utc::now())
}

pub(crate) fn compute_next_at(job: &Job, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    match job.job_type {
        JobType::Scheduled => next_for_schedule(job.schedule.as_ref(), now),
        JobType::Interval => next_for_interval(job.interval.as_ref(), now),
    }
}

fn next_for_schedule(
    descriptor: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let descriptor = descriptor
        .ok_or_else(|| ScheduleError::InvalidDescriptor("schedule is required".into()))?;
    let spec: ScheduleSpec = serde_json::from_value(descriptor.clone())
        .map_err(|err| ScheduleError::InvalidDescriptor(err.to_string()))?;
    let execute_at = spec
        .execute_at
        .ok_or_else(|| ScheduleError::InvalidDescriptor("execute_at is required".into()))?;

    if execute_at == "now" {
        return Ok(now + Duration::seconds(NOW_GRACE_SECONDS));
    }

    let parsed = NaiveDateTime::parse_from_str(&execute_at, EXECUTE_AT_FORMAT)
        .map_err(|_| {
            ScheduleError::InvalidDescriptor(format!("unsupported datetime format: {execute_at}"))
        })?
        .and_utc();

    if parsed < now {
        return Err(ScheduleError::PastInstant(parsed));
    }
    Ok(parsed)
}

fn next_for_interval(
    descriptor: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let descriptor = descriptor
        .ok_or_else(|| ScheduleError::InvalidDescriptor("interval is required".into()))?;
    let spec: IntervalSpec = serde_json::from_value(descriptor.clone())
        .map_err(|err| ScheduleError::InvalidDescriptor(err.to_string()))?;
    if spec.interval_type.is_empty() {
        return Err(ScheduleError::InvalidDescriptor(
            "interval_type is required".into(),
        ));
    }
    let value = spec
        .value
        .ok_or_else(|| ScheduleError::InvalidDescriptor("value is required".into()))?;

    // Firing times follow the machine's local clock, like crontab would.
    next_cron_in_zone(&value, now.with_timezone(&Local)).map(|next| next.with_timezone(&Utc))
}

fn next_cron_in_zone<Tz: TimeZone>(
    expression: &str,
    after: DateTime<Tz>,
) -> Result<DateTime<Tz>, ScheduleError> {
    let normalized = normalize_expression(expression)?;
    let schedule = Schedule::from_str(&normalized)
        .map_err(|err| ScheduleError::UnparsableCron(format!("{expression}: {err}")))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| {
            ScheduleError::UnparsableCron(format!("{expression}: no future occurrence"))
        })
}

/// The `cron` crate natively speaks 6/7 fields (with seconds and an
/// optional year); standard crontab syntax gets a seconds field prepended.
fn normalize_expression(expression: &str) -> Result<String, ScheduleError> {
    let expression = expression.trim();
    match expression.split_whitespace().count() {
        5 => Ok(format!("0 {expression}")),
        6 | 7 => Ok(expression.to_string()),
        count => Err(ScheduleError::UnparsableCron(format!(
            "{expression}: expected 5, 6, or 7 fields, got {count}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use serde_json::json;
    use uuid::Uuid;

    fn job(job_type: JobType, schedule: Option<serde_json::Value>, interval: Option<serde_json::Value>) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            name: "test".into(),
            user_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            payload: json!({}),
            status: crate::models::JobStatus::Active,
            job_type,
            schedule,
            interval,
            is_deleted: false,
            enable_recovery: true,
            next_run_at: None,
            last_run_at: None,
            current_task_id: None,
            interval_progress: None,
            current_interval_id: None,
            interval_started_at: None,
            queue_entry_id: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    #[test]
    fn execute_now_fires_after_the_grace() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let job = job(JobType::Scheduled, Some(json!({"execute_at": "now"})), None);
        let next = compute_next_at(&job, now).unwrap();
        assert_eq!(next, now + Duration::seconds(2));
    }

    #[test]
    fn explicit_instant_parses_with_milliseconds() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let job = job(
            JobType::Scheduled,
            Some(json!({"execute_at": "2030-01-01T00:00:00.000Z"})),
            None,
        );
        let next = compute_next_at(&job, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn past_instant_is_rejected() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let job = job(
            JobType::Scheduled,
            Some(json!({"execute_at": "2020-01-01T00:00:00.000Z"})),
            None,
        );
        let err = compute_next_at(&job, now).unwrap_err();
        assert!(matches!(err, ScheduleError::PastInstant(_)));
    }

    #[test]
    fn timezone_offsets_and_missing_fields_are_rejected() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        for descriptor in [
            json!({"execute_at": "2030-01-01T00:00:00+02:00"}),
            json!({"execute_at": "2030-01-01"}),
            json!({}),
        ] {
            let job = job(JobType::Scheduled, Some(descriptor), None);
            let err = compute_next_at(&job, now).unwrap_err();
            assert!(matches!(err, ScheduleError::InvalidDescriptor(_)));
        }
    }

    #[test]
    fn five_field_cron_lands_on_the_next_boundary() {
        // :02:30 with an every-five-minutes expression fires at :05:00.
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 10, 2, 30).unwrap();
        let next = next_cron_in_zone("*/5 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn firing_is_strictly_after_the_reference_instant() {
        let boundary = Utc.with_ymd_and_hms(2026, 8, 1, 10, 5, 0).unwrap();
        let next = next_cron_in_zone("*/5 * * * *", boundary).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 1, 10, 10, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        assert_ok!(next_cron_in_zone("0 0 8 * * *", after));
    }

    #[test]
    fn malformed_cron_is_rejected() {
        let after = Utc::now();
        assert_err!(next_cron_in_zone("not a cron", after));
        assert_err!(next_cron_in_zone("* * *", after));

        let job = job(
            JobType::Interval,
            None,
            Some(json!({"interval_type": "minutes", "value": "bogus cron here no"})),
        );
        let err = compute_next_at(&job, after).unwrap_err();
        assert!(matches!(err, ScheduleError::UnparsableCron(_)));
    }

    #[test]
    fn interval_descriptor_requires_type_and_value() {
        let now = Utc::now();
        for descriptor in [
            json!({"interval_type": "", "value": "*/5 * * * *"}),
            json!({"interval_type": "minutes"}),
        ] {
            let job = job(JobType::Interval, None, Some(descriptor));
            let err = compute_next_at(&job, now).unwrap_err();
            assert!(matches!(err, ScheduleError::InvalidDescriptor(_)));
        }
    }
}
