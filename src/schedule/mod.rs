//! Recurrence specifications and trigger decisions.
//!
//! Daily, weekly and monthly recurrences fire on elapsed duration alone
//! (24h, 7d, 30d). Their time-of-day, weekday and day-of-month fields are
//! stored and validated but not consulted when deciding whether to fire.

mod cron_expr;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejections raised while building or validating a recurrence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("time of day is required for daily, weekly and monthly intervals")]
    MissingTimeOfDay,
    #[error("weekday is required for weekly intervals")]
    MissingWeekday,
    #[error("day of month is required for monthly intervals")]
    MissingDayOfMonth,
    #[error("cron expression is required for CRON intervals")]
    MissingCronExpression,
    #[error("invalid time of day {0:?}, expected HH:MM")]
    InvalidTimeOfDay(String),
    #[error("invalid weekday {0}, expected 1 (Monday) to 7 (Sunday)")]
    InvalidWeekday(u8),
    #[error("invalid day of month {0}, expected 1 to 31")]
    InvalidDayOfMonth(u32),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

/// Decides whether something is due, given when it last ran.
pub trait Trigger {
    fn should_trigger(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool;
}

/// When a target should next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RecurrenceRecord", into = "RecurrenceRecord")]
pub enum RecurrenceSpec {
    Hourly,
    Daily {
        time_of_day: NaiveTime,
    },
    Weekly {
        time_of_day: NaiveTime,
        weekday: Weekday,
    },
    Monthly {
        time_of_day: NaiveTime,
        day_of_month: u32,
    },
    Cron {
        expression: String,
    },
}

impl RecurrenceSpec {
    /// Build a cron recurrence, rejecting expressions that do not parse.
    pub fn cron(expression: impl Into<String>) -> Result<Self, RecurrenceError> {
        let spec = RecurrenceSpec::Cron {
            expression: expression.into(),
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), RecurrenceError> {
        match self {
            RecurrenceSpec::Hourly | RecurrenceSpec::Daily { .. } | RecurrenceSpec::Weekly { .. } => Ok(()),
            RecurrenceSpec::Monthly { day_of_month, .. } => {
                if (1..=31).contains(day_of_month) {
                    Ok(())
                } else {
                    Err(RecurrenceError::InvalidDayOfMonth(*day_of_month))
                }
            }
            RecurrenceSpec::Cron { expression } => {
                if expression.trim().is_empty() {
                    return Err(RecurrenceError::MissingCronExpression);
                }
                cron_expr::parse(expression)
                    .map(|_| ())
                    .map_err(RecurrenceError::InvalidCron)
            }
        }
    }

    pub fn kind(&self) -> IntervalKind {
        match self {
            RecurrenceSpec::Hourly => IntervalKind::Hourly,
            RecurrenceSpec::Daily { .. } => IntervalKind::Daily,
            RecurrenceSpec::Weekly { .. } => IntervalKind::Weekly,
            RecurrenceSpec::Monthly { .. } => IntervalKind::Monthly,
            RecurrenceSpec::Cron { .. } => IntervalKind::Cron,
        }
    }

    fn min_elapsed(&self) -> Option<ChronoDuration> {
        match self {
            RecurrenceSpec::Hourly => Some(ChronoDuration::hours(1)),
            RecurrenceSpec::Daily { .. } => Some(ChronoDuration::hours(24)),
            RecurrenceSpec::Weekly { .. } => Some(ChronoDuration::days(7)),
            RecurrenceSpec::Monthly { .. } => Some(ChronoDuration::days(30)),
            RecurrenceSpec::Cron { .. } => None,
        }
    }
}

impl Trigger for RecurrenceSpec {
    fn should_trigger(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
        let Some(last_run) = last_run else {
            return true;
        };

        if let Some(min) = self.min_elapsed() {
            return now - last_run >= min;
        }

        let RecurrenceSpec::Cron { expression } = self else {
            return false;
        };

        // Fails closed: an expression that no longer parses never fires.
        match cron_expr::parse(expression) {
            Ok(schedule) => match cron_expr::next_after(&schedule, last_run) {
                Some(next) => now >= next,
                None => false,
            },
            Err(e) => {
                tracing::warn!("Recurrence: unparsable cron expression {:?}: {}", expression, e);
                false
            }
        }
    }
}

/// Fixed minimum gap between runs, e.g. a target's polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown(pub Duration);

impl Cooldown {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }
}

impl Trigger for Cooldown {
    fn should_trigger(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
        let Some(last_run) = last_run else {
            return true;
        };

        match ChronoDuration::from_std(self.0) {
            Ok(min) => now - last_run >= min,
            Err(_) => false,
        }
    }
}

/// Interval discriminator in the record form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalKind {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Cron,
}

impl fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntervalKind::Hourly => "HOURLY",
            IntervalKind::Daily => "DAILY",
            IntervalKind::Weekly => "WEEKLY",
            IntervalKind::Monthly => "MONTHLY",
            IntervalKind::Cron => "CRON",
        };
        f.write_str(s)
    }
}

/// Flat, optional-field form of a recurrence as it is stored and exchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRecord {
    pub interval: IntervalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<String>,
    /// 1 (Monday) to 7 (Sunday).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekday: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
}

impl TryFrom<RecurrenceRecord> for RecurrenceSpec {
    type Error = RecurrenceError;

    fn try_from(record: RecurrenceRecord) -> Result<Self, Self::Error> {
        let needs_time = matches!(
            record.interval,
            IntervalKind::Daily | IntervalKind::Weekly | IntervalKind::Monthly
        );
        let time_of_day = match (&record.time_of_day, needs_time) {
            (None, true) => return Err(RecurrenceError::MissingTimeOfDay),
            (Some(raw), true) => Some(parse_time_of_day(raw)?),
            (_, false) => None,
        };

        let spec = match record.interval {
            IntervalKind::Hourly => RecurrenceSpec::Hourly,
            IntervalKind::Daily => RecurrenceSpec::Daily {
                time_of_day: time_of_day.ok_or(RecurrenceError::MissingTimeOfDay)?,
            },
            IntervalKind::Weekly => {
                let n = record.weekday.ok_or(RecurrenceError::MissingWeekday)?;
                RecurrenceSpec::Weekly {
                    time_of_day: time_of_day.ok_or(RecurrenceError::MissingTimeOfDay)?,
                    weekday: weekday_from_number(n)?,
                }
            }
            IntervalKind::Monthly => RecurrenceSpec::Monthly {
                time_of_day: time_of_day.ok_or(RecurrenceError::MissingTimeOfDay)?,
                day_of_month: record.day_of_month.ok_or(RecurrenceError::MissingDayOfMonth)?,
            },
            IntervalKind::Cron => RecurrenceSpec::Cron {
                expression: record
                    .cron_expr
                    .filter(|e| !e.trim().is_empty())
                    .ok_or(RecurrenceError::MissingCronExpression)?,
            },
        };

        spec.validate()?;
        Ok(spec)
    }
}

impl From<RecurrenceSpec> for RecurrenceRecord {
    fn from(spec: RecurrenceSpec) -> Self {
        let mut record = RecurrenceRecord {
            interval: spec.kind(),
            time_of_day: None,
            weekday: None,
            day_of_month: None,
            cron_expr: None,
        };

        match spec {
            RecurrenceSpec::Hourly => {}
            RecurrenceSpec::Daily { time_of_day } => {
                record.time_of_day = Some(time_of_day.format("%H:%M").to_string());
            }
            RecurrenceSpec::Weekly { time_of_day, weekday } => {
                record.time_of_day = Some(time_of_day.format("%H:%M").to_string());
                record.weekday = Some(weekday.number_from_monday() as u8);
            }
            RecurrenceSpec::Monthly { time_of_day, day_of_month } => {
                record.time_of_day = Some(time_of_day.format("%H:%M").to_string());
                record.day_of_month = Some(day_of_month);
            }
            RecurrenceSpec::Cron { expression } => {
                record.cron_expr = Some(expression);
            }
        }

        record
    }
}

fn parse_time_of_day(raw: &str) -> Result<NaiveTime, RecurrenceError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| RecurrenceError::InvalidTimeOfDay(raw.to_string()))
}

fn weekday_from_number(n: u8) -> Result<Weekday, RecurrenceError> {
    match n {
        1 => Ok(Weekday::Mon),
        2 => Ok(Weekday::Tue),
        3 => Ok(Weekday::Wed),
        4 => Ok(Weekday::Thu),
        5 => Ok(Weekday::Fri),
        6 => Ok(Weekday::Sat),
        7 => Ok(Weekday::Sun),
        other => Err(RecurrenceError::InvalidWeekday(other)),
    }
}
