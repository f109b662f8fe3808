//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! numbers, `a-b` ranges, comma lists, and `/n` steps. Day-of-week 0 and 7
//! are both Sunday. When both day fields are restricted a day matches if
//! either does, as in classic cron. All times are UTC.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    days_restricted: bool,
    weekdays_restricted: bool,
}

// Search horizon; covers Feb 29 on a weekday-restricted schedule.
const MAX_SEARCH_DAYS: i64 = 366 * 8;

fn invalid(expr: &str, reason: impl Into<String>) -> BackupError {
    BackupError::InvalidSchedule {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn parse_field(expr: &str, field: &str, min: u32, max: u32) -> Result<u64> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| invalid(expr, format!("bad step {:?}", s)))?;
                if step == 0 {
                    return Err(invalid(expr, "step must be positive"));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid(expr, format!("bad value {:?}", a)))?;
            let b: u32 = b.parse().map_err(|_| invalid(expr, format!("bad value {:?}", b)))?;
            (a, b)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| invalid(expr, format!("bad value {:?}", range)))?;
            if part.contains('/') {
                (v, max)
            } else {
                (v, v)
            }
        };
        if lo < min || hi > max || lo > hi {
            return Err(invalid(
                expr,
                format!("{:?} outside {}-{}", range, min, max),
            ));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(mask)
}

impl CronSchedule {
    /// Parses an expression such as `0 2 * * *` or `@daily`.
    pub fn parse(expr: &str) -> Result<Self> {
        let expanded = match expr.trim() {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(expr, format!("expected 5 fields, got {}", fields.len())));
        }
        let mut weekdays = parse_field(expr, fields[4], 0, 7)?;
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }
        Ok(Self {
            expr: expr.trim().to_string(),
            minutes: parse_field(expr, fields[0], 0, 59)?,
            hours: parse_field(expr, fields[1], 0, 23)?,
            days: parse_field(expr, fields[2], 1, 31)?,
            months: parse_field(expr, fields[3], 1, 12)?,
            weekdays,
            days_restricted: fields[2] != "*",
            weekdays_restricted: fields[4] != "*",
        })
    }

    /// The expression as written.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days & (1 << date.day()) != 0;
        let dow = self.weekdays & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.days_restricted, self.weekdays_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// True if `t` falls on a firing minute.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.months & (1 << t.month()) != 0
            && self.day_matches(t.date_naive())
            && self.hours & (1 << t.hour()) != 0
            && self.minutes & (1 << t.minute()) != 0
    }

    /// First firing minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.timestamp().div_euclid(60) * 60 + 60;
        let mut t = Utc.timestamp_opt(start, 0).single()?;
        let limit = after + Duration::days(MAX_SEARCH_DAYS);

        while t <= limit {
            if self.months & (1 << t.month()) == 0 {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.from_utc_datetime(&NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?);
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = Utc.from_utc_datetime(&t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?);
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}
