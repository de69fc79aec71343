//! Parsing and evaluation of job trigger expressions.
//!
//! Accepted forms, all evaluated in UTC:
//! - five-field cron (`min hour dom month dow`, seconds fixed at 0)
//! - six-field cron (`sec min hour dom month dow`)
//! - named intervals (`@daily`, `@hourly`, `every minute`, `weekly`, ...)
//! - fixed intervals anchored at registration (`@every 90s`, `@every 1h30m`)
//!
//! Day-of-week numbers follow the usual crontab convention (0 or 7 is Sunday).
//! Numbers, names and ranges of either are rewritten to a list of day names
//! before reaching the `cron` crate, which numbers days from 1.

use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;

use crate::errors::SchedulerError;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed trigger. Produced once when a job is registered.
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(Box<Schedule>),
    Every {
        interval: TimeDelta,
        anchor: DateTime<Utc>,
    },
}

impl Trigger {
    /// Parses `expression`; `anchor` is the origin of `@every` intervals.
    pub fn parse(expression: &str, anchor: DateTime<Utc>) -> Result<Self, SchedulerError> {
        let normalized = expression.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return Err(SchedulerError::invalid_trigger(expression, "expression is empty"));
        }
        let lowered = normalized.to_ascii_lowercase();

        if let Some(duration) = lowered.strip_prefix("@every ") {
            return parse_interval(expression, duration, anchor);
        }

        let cron_expression = match named_schedule(&lowered) {
            Some(mapped) => mapped.to_string(),
            None if lowered.starts_with('@') || lowered.starts_with("every ") => {
                return Err(SchedulerError::invalid_trigger(expression, "unknown named interval"));
            }
            None => cron_fields(expression, &normalized)?,
        };

        Schedule::from_str(&cron_expression)
            .map(|schedule| Trigger::Cron(Box::new(schedule)))
            .map_err(|e| SchedulerError::invalid_trigger(expression, e.to_string()))
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(schedule) => schedule.after(&after).next(),
            Trigger::Every { interval, anchor } => {
                let step = interval.num_seconds();
                if after < *anchor {
                    return anchor.checked_add_signed(*interval);
                }
                let periods = (after - *anchor).num_seconds() / step + 1;
                anchor.checked_add_signed(TimeDelta::seconds(step.checked_mul(periods)?))
            }
        }
    }

    /// True when some occurrence `o` satisfies `since < o <= now`.
    pub fn is_due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_after(since).is_some_and(|occurrence| occurrence <= now)
    }
}

fn named_schedule(lowered: &str) -> Option<&'static str> {
    let mapped = match lowered {
        "@yearly" | "@annually" | "yearly" | "every year" => "0 0 0 1 1 *",
        "@monthly" | "monthly" | "every month" => "0 0 0 1 * *",
        "@weekly" | "weekly" | "every week" => "0 0 0 * * Sun",
        "@daily" | "@midnight" | "daily" | "every day" => "0 0 0 * * *",
        "@hourly" | "hourly" | "every hour" => "0 0 * * * *",
        "@minutely" | "minutely" | "every minute" => "0 * * * * *",
        _ => return None,
    };
    Some(mapped)
}

fn parse_interval(
    expression: &str,
    duration: &str,
    anchor: DateTime<Utc>,
) -> Result<Trigger, SchedulerError> {
    let duration = humantime::parse_duration(duration.trim())
        .map_err(|e| SchedulerError::invalid_trigger(expression, e.to_string()))?;
    if duration.as_secs() == 0 || duration.subsec_nanos() != 0 {
        return Err(SchedulerError::invalid_trigger(
            expression,
            "interval must be a whole number of seconds, at least 1s",
        ));
    }
    let interval = TimeDelta::from_std(duration)
        .map_err(|_| SchedulerError::invalid_trigger(expression, "interval is too large"))?;
    Ok(Trigger::Every { interval, anchor })
}

/// Rewrites a five- or six-field crontab line into the six-field form the
/// `cron` crate expects.
fn cron_fields(expression: &str, normalized: &str) -> Result<String, SchedulerError> {
    let mut fields: Vec<String> = normalized.split(' ').map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 => {}
        n => {
            return Err(SchedulerError::invalid_trigger(
                expression,
                format!("expected 5 or 6 fields, found {n}"),
            ));
        }
    }
    fields[5] = day_of_week_field(expression, &fields[5])?;
    Ok(fields.join(" "))
}

fn day_of_week_field(expression: &str, field: &str) -> Result<String, SchedulerError> {
    let mut days: Vec<&'static str> = Vec::new();
    let mut passthrough: Vec<&str> = Vec::new();

    for part in field.split(',') {
        if part == "*" || part == "?" {
            passthrough.push(part);
            continue;
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| SchedulerError::invalid_trigger(expression, format!("invalid day-of-week step '{part}'")))?;
                (range, Some(step))
            }
            None => (part, None),
        };
        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (weekday_number(expression, start)?, weekday_number(expression, end)?),
                None => {
                    let start = weekday_number(expression, range)?;
                    (start, if step.is_some() { 6 } else { start })
                }
            },
        };
        // `Fri-Sun`: Sunday closes the week.
        let end = if end == 0 && start > 0 { 7 } else { end };
        if start > end {
            return Err(SchedulerError::invalid_trigger(
                expression,
                format!("day-of-week range '{part}' runs backwards"),
            ));
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            let name = DAY_NAMES[day % 7];
            if !days.contains(&name) {
                days.push(name);
            }
        }
    }

    let mut parts: Vec<&str> = passthrough;
    parts.extend(days);
    Ok(parts.join(","))
}

const FULL_DAY_NAMES: [&str; 7] = ["sunday", "monday", "tuesday", "wednesday", "thursday", "friday", "saturday"];

/// `0`-`7` (0 and 7 are Sunday), `Mon`, or `monday`, in any case.
fn weekday_number(expression: &str, value: &str) -> Result<usize, SchedulerError> {
    let lowered = value.to_ascii_lowercase();
    let by_name = FULL_DAY_NAMES
        .iter()
        .position(|full| lowered == *full || (lowered.len() == 3 && full.starts_with(lowered.as_str())));
    by_name
        .or_else(|| value.parse::<usize>().ok().filter(|day| *day <= 7))
        .ok_or_else(|| SchedulerError::invalid_trigger(expression, format!("invalid day of week '{value}'")))
}
