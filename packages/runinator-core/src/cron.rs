//! Classic 5-field cron expressions and next-fire-time arithmetic.
//!
//! Supports `minute hour day-of-month month day-of-week` with `*`, single
//! integers, `a-b` ranges, `*/step` and `a-b/step`, and comma lists. Named
//! months and weekdays are not accepted. All evaluation is in UTC.
//!
//! # Example
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use runinator_core::cron::CronSchedule;
//!
//! let schedule = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
//! let t = Utc.with_ymd_and_hms(2025, 1, 16, 10, 3, 0).unwrap();
//! assert_eq!(
//!     schedule.next_after(t),
//!     Utc.with_ymd_and_hms(2025, 1, 16, 10, 15, 0).unwrap()
//! );
//! ```

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Error produced when a cron expression fails to parse.
///
/// `field` names the offending field ("minute", "hour", "day-of-month",
/// "month", "day-of-week", or "expression" for structural problems).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cron {field}: {reason}")]
pub struct CronParseError {
    pub field: &'static str,
    pub reason: String,
}

impl CronParseError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// A parsed cron schedule.
///
/// Each field is a bitmask of the allowed values. When both day-of-month and
/// day-of-week are restricted (neither is `*`), a day matches if *either*
/// field matches, per classic cron.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a 5-field cron expression.
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::new(
                "expression",
                format!("expected 5 fields, got {}", fields.len()),
            ));
        }

        let minutes = parse_field(fields[0], 0, 59, "minute")?;
        let hours = parse_field(fields[1], 0, 23, "hour")? as u32;
        let days_of_month = parse_field(fields[2], 1, 31, "day-of-month")? as u32;
        let months = parse_field(fields[3], 1, 12, "month")? as u16;
        let days_of_week = parse_dow(fields[4])?;

        let schedule = Self {
            expression: expression.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        };
        schedule.check_satisfiable()?;
        Ok(schedule)
    }

    /// The original expression text.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The smallest instant strictly after `t` that matches every field.
    ///
    /// The result is always on the minute grid (seconds and sub-seconds are
    /// zero). Month and year boundaries roll over; leap years come out of
    /// chrono's date arithmetic.
    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        // Truncate to the minute, then step forward at least one minute so
        // the result is strictly greater than `t`.
        let mut cur = truncate_to_minute(t) + Duration::minutes(1);

        loop {
            if self.months & (1 << cur.month()) == 0 {
                cur = first_minute_of_next_month(cur);
                continue;
            }
            if !self.day_matches(cur) {
                cur = truncate_to_day(cur) + Duration::days(1);
                continue;
            }
            if self.hours & (1 << cur.hour()) == 0 {
                cur = truncate_to_hour(cur) + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << cur.minute()) == 0 {
                cur += Duration::minutes(1);
                continue;
            }
            return cur;
        }
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_ok = self.days_of_month & (1 << t.day()) != 0;
        let dow_ok = self.days_of_week & (1 << t.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            // Classic cron: both restricted means either may match.
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Reject expressions that can never fire, e.g. `0 0 31 2 *`.
    ///
    /// Day-of-week-restricted schedules are always satisfiable, so only the
    /// dom-only case needs the check.
    fn check_satisfiable(&self) -> Result<(), CronParseError> {
        if !self.dom_restricted || self.dow_restricted {
            return Ok(());
        }
        for month in 1..=12u32 {
            if self.months & (1 << month) == 0 {
                continue;
            }
            let max_day = match month {
                2 => 29,
                4 | 6 | 9 | 11 => 30,
                _ => 31,
            };
            for day in 1..=max_day {
                if self.days_of_month & (1 << day) != 0 {
                    return Ok(());
                }
            }
        }
        Err(CronParseError::new(
            "day-of-month",
            "day never occurs in any allowed month",
        ))
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

impl std::str::FromStr for CronSchedule {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = CronParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<CronSchedule> for String {
    fn from(s: CronSchedule) -> String {
        s.expression
    }
}

/// Parse one field into a bitmask over `[min, max]`.
fn parse_field(spec: &str, min: u32, max: u32, field: &'static str) -> Result<u64, CronParseError> {
    let mut mask = 0u64;
    for part in spec.split(',') {
        if part.is_empty() {
            return Err(CronParseError::new(field, "empty list element"));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| CronParseError::new(field, format!("bad step '{step}'")))?;
                if step == 0 {
                    return Err(CronParseError::new(field, "step must be positive"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, min, max, field)?;
            let hi = parse_value(b, min, max, field)?;
            if lo > hi {
                return Err(CronParseError::new(
                    field,
                    format!("range {lo}-{hi} is inverted"),
                ));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, min, max, field)?;
            if step != 1 {
                // "5/2" style: step from the value to the field maximum.
                (v, max)
            } else {
                (v, v)
            }
        };

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32, field: &'static str) -> Result<u32, CronParseError> {
    let v: u32 = s
        .parse()
        .map_err(|_| CronParseError::new(field, format!("'{s}' is not an integer")))?;
    if v < min || v > max {
        return Err(CronParseError::new(
            field,
            format!("{v} is outside {min}-{max}"),
        ));
    }
    Ok(v)
}

/// Day-of-week accepts 0-7 with 7 meaning Sunday, normalized to bit 0.
fn parse_dow(spec: &str) -> Result<u8, CronParseError> {
    let raw = parse_field(spec, 0, 7, "day-of-week")?;
    let mut mask = (raw & 0x7f) as u8;
    if raw & (1 << 7) != 0 {
        mask |= 1;
    }
    Ok(mask)
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), t.minute(), 0)
        .single()
        .unwrap_or(t)
}

fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()
        .unwrap_or(t)
}

fn truncate_to_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t)
}

fn first_minute_of_next_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is always a valid instant")
}
