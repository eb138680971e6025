use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// A parsed cron expression bound to the zone it is evaluated in.
///
/// Construction is the only fallible step; evaluation is pure and always
/// yields the same answer for the same reference instant.
#[derive(Debug, Clone)]
pub struct CronClock {
    /// Normalised 6/7-field source text. Equality is decided on this.
    expression: String,
    schedule: Schedule,
    time_zone: Tz,
}

impl CronClock {
    /// Parse `expression` for evaluation in `time_zone`.
    ///
    /// Classic 5-field expressions (minute resolution) are accepted and get a
    /// `0` seconds field prepended; 6-field (seconds) and 7-field (seconds +
    /// year) expressions are used as-is.
    pub fn parse(expression: &str, time_zone: Tz) -> Result<Self> {
        let normalized = normalize(expression)?;
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
                expression: expression.trim().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: normalized,
            schedule,
            time_zone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    /// Next firing instant strictly after `after`, or `None` when the
    /// expression has no occurrence left (e.g. a year field in the past).
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_occurrence(&self.schedule, after, self.time_zone)
    }
}

impl PartialEq for CronClock {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.time_zone == other.time_zone
    }
}

impl Eq for CronClock {}

/// Compute the next UTC firing time for `schedule` evaluated in `time_zone`,
/// starting *after* `from`.
pub fn next_occurrence(
    schedule: &Schedule,
    from: DateTime<Utc>,
    time_zone: Tz,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&from.with_timezone(&time_zone))
        .next()
        .map(|at| at.with_timezone(&Utc))
}

/// Resolve an IANA zone name such as `Europe/Amsterdam`.
pub fn parse_time_zone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimeZone(name.to_string()))
}

fn normalize(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(SchedulerError::InvalidCron {
            expression: expression.trim().to_string(),
            reason: format!("expected 5, 6 or 7 fields, found {n}"),
        }),
    }
}
