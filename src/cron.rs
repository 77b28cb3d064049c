//! Cron schedules for recurring jobs.
//!
//! Producers pass the classic five-field form (`"30 7 * * 1-5"`) or the
//! six-field form with seconds (`"0 30 7 * * 1-5"`); five-field expressions
//! fire on second zero.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("Cron expression {0} has no upcoming occurrence")]
    Exhausted(String),
}

/// A parsed cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    timezone: Tz,
    schedule: Schedule,
}

impl CronSchedule {
    /// Create a schedule evaluated in UTC.
    pub fn new(expression: &str) -> Result<Self, CronError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Create a schedule evaluated in an IANA timezone such as `Asia/Kolkata`.
    pub fn with_timezone(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let normalized = normalize(expression)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))?;

        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;

        Ok(CronSchedule {
            expression: expression.trim().to_string(),
            timezone,
            schedule,
        })
    }

    /// The expression as the producer wrote it.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }

    /// Next occurrence strictly after `after`.
    pub fn next_execution(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after_tz = after.with_timezone(&self.timezone);
        let next_tz = self.schedule.after(&after_tz).next()?;
        Some(next_tz.with_timezone(&Utc))
    }

    /// Like [`next_execution`](Self::next_execution), but an expression with no
    /// future occurrence is an error.
    pub fn require_next(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        self.next_execution(after)
            .ok_or_else(|| CronError::Exhausted(self.expression.clone()))
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Prefix a seconds field onto five-field expressions.
fn normalize(expression: &str) -> Result<String, CronError> {
    let fields = expression.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {}", expression.trim())),
        6 | 7 => Ok(expression.trim().to_string()),
        _ => Err(CronError::InvalidExpression(format!(
            "{}: expected 5, 6 or 7 fields, found {}",
            expression, fields
        ))),
    }
}
