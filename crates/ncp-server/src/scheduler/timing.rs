// crates/ncp-server/src/scheduler/timing.rs
// Cron expression parsing, validation, and occurrence math

use crate::error::{NcpError, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Normalize a cron expression to the six-field form the parser expects.
/// Five-field (minute-resolution) expressions get a `0` seconds field.
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    }
}

/// Parse a cron expression plus optional IANA timezone.
pub fn parse_schedule(expression: &str, timezone: Option<&str>) -> Result<(Schedule, Tz)> {
    let normalized = normalize_cron(expression);
    let schedule = Schedule::from_str(&normalized).map_err(|e| {
        NcpError::ValidationFailed(format!("invalid cron expression {:?}: {}", expression, e))
    })?;
    let tz = match timezone {
        Some(name) => name.parse::<Tz>().map_err(|_| {
            NcpError::ValidationFailed(format!("unknown timezone {:?}", name))
        })?,
        None => Tz::UTC,
    };
    Ok((schedule, tz))
}

/// The next `n` fire times, in UTC.
pub fn next_occurrences(schedule: &Schedule, tz: Tz, n: usize) -> Vec<DateTime<Utc>> {
    schedule
        .upcoming(tz)
        .take(n)
        .map(|dt| dt.with_timezone(&Utc))
        .collect()
}

/// The first fire time strictly after `after`, in UTC.
pub fn next_after(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whether the schedule had at least one fire time in `(after, before)`.
/// Used for catch-up: any number of missed slots collapses to one firing.
pub fn fired_between(
    schedule: &Schedule,
    tz: Tz,
    after: DateTime<Utc>,
    before: DateTime<Utc>,
) -> bool {
    match next_after(schedule, tz, after) {
        Some(next) => next < before,
        None => false,
    }
}

/// Human-readable field-by-field explanation of a normalized expression.
pub fn describe(expression: &str) -> String {
    let normalized = normalize_cron(expression);
    let fields: Vec<&str> = normalized.split_whitespace().collect();
    let names = [
        "second", "minute", "hour", "day-of-month", "month", "day-of-week", "year",
    ];
    let parts: Vec<String> = fields
        .iter()
        .zip(names.iter())
        .map(|(value, name)| format!("{}: {}", name, describe_field(value)))
        .collect();
    parts.join(", ")
}

fn describe_field(value: &str) -> String {
    if value == "*" {
        return "any".to_string();
    }
    if let Some(step) = value.strip_prefix("*/") {
        return format!("every {}", step);
    }
    value.to_string()
}
