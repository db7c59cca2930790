//! Cron expression parsing.
//!
//! Only standard five-field expressions and `@` descriptors are accepted.
//! The `cron` crate wants a leading seconds field and numbers weekdays
//! 1 (Sunday) through 7, while standard expressions number them 0-6 with 7
//! as an alias for Sunday, so weekdays are rewritten as day names.
//!
//! The `cron` crate also requires both day fields to match. Standard cron
//! fires when either matches if both are restricted, so such expressions
//! compile to two schedules and the earlier occurrence wins.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use ::cron::Schedule;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedules: Vec<Schedule>,
}

/// Parse a five-field cron expression or an `@` descriptor.
pub fn parse(expr: &str) -> Result<CronSchedule, String> {
    let schedules = normalize(expr)?
        .iter()
        .map(|s| Schedule::from_str(s).map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CronSchedule { schedules })
}

/// The first scheduled instant strictly after `after`.
pub fn next_after(schedule: &CronSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .schedules
        .iter()
        .filter_map(|s| s.after(&after).next())
        .min()
}

fn normalize(expr: &str) -> Result<Vec<String>, String> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err("empty cron expression".to_string());
    }

    if trimmed.starts_with('@') {
        return Ok(vec![trimmed.to_string()]);
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }

    let (minute, hour, day, month) = (fields[0], fields[1], fields[2], fields[3]);
    let weekday = normalize_weekday_field(fields[4])?;

    if is_restricted(day) && is_restricted(fields[4]) {
        Ok(vec![
            format!("0 {} {} {} {} *", minute, hour, day, month),
            format!("0 {} {} * {} {}", minute, hour, month, weekday),
        ])
    } else {
        Ok(vec![format!("0 {} {} {} {} {}", minute, hour, day, month, weekday)])
    }
}

/// A day field starting with `*` or `?` matches every day.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

fn normalize_weekday_field(field: &str) -> Result<String, String> {
    field
        .split(',')
        .map(normalize_weekday_item)
        .collect::<Result<Vec<_>, _>>()
        .map(|items| items.join(","))
}

fn normalize_weekday_item(item: &str) -> Result<String, String> {
    let (range, step) = match item.split_once('/') {
        Some((r, s)) => (r, Some(s)),
        None => (item, None),
    };

    let step_len = match step {
        Some(s) => match s.parse::<u8>() {
            Ok(n) if n > 0 => n,
            _ => return Err(format!("bad weekday step: {}", s)),
        },
        None => 1,
    };

    if range == "*" || range == "?" {
        return Ok(match step {
            Some(_) => expand_weekdays(0, 6, step_len),
            None => range.to_string(),
        });
    }

    // Numeric days are spelled out one by one so 7 never has to close a range.
    match range.split_once('-') {
        Some((start, end)) => match (weekday_number(start)?, weekday_number(end)?) {
            (Some(s), Some(e)) if s <= e => Ok(expand_weekdays(s, e, step_len)),
            (Some(s), Some(e)) => Err(format!("descending weekday range: {}-{}", s, e)),
            (start_num, end_num) => {
                let body = format!("{}-{}", weekday_name(start, start_num), weekday_name(end, end_num));
                Ok(match step {
                    Some(s) => format!("{}/{}", body, s),
                    None => body,
                })
            }
        },
        None => match (weekday_number(range)?, step) {
            (Some(n), Some(_)) => Ok(expand_weekdays(n, 6, step_len)),
            (Some(n), None) => Ok(weekday_name(range, Some(n))),
            (None, Some(s)) => Ok(format!("{}/{}", range, s)),
            (None, None) => Ok(range.to_string()),
        },
    }
}

fn expand_weekdays(start: u8, end: u8, step: u8) -> String {
    let mut names: Vec<&str> = Vec::new();
    for n in (start..=end).step_by(step as usize) {
        let name = DAY_NAMES[(n % 7) as usize];
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names.join(",")
}

/// `Some(n)` for a numeric weekday, `None` for a name left as written.
fn weekday_number(token: &str) -> Result<Option<u8>, String> {
    if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
        let n: u8 = token.parse().map_err(|_| format!("bad weekday: {}", token))?;
        if n > 7 {
            return Err(format!("weekday out of range: {}", n));
        }
        Ok(Some(n))
    } else {
        Ok(None)
    }
}

fn weekday_name(token: &str, num: Option<u8>) -> String {
    match num {
        Some(n) => DAY_NAMES[(n % 7) as usize].to_string(),
        None => token.to_string(),
    }
}
