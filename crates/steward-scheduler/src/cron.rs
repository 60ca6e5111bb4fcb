//! Cron expression parser and next-fire evaluator.
//! Format: "MIN HOUR DOM MON DOW" (5 fields, no seconds), always evaluated in UTC.
//! Fields accept: *, N, A-B, */S, A-B/S, N/S and comma lists of those.
//! Months accept JAN-DEC, weekdays SUN-SAT; weekday 7 is Sunday.
//! Example: "0 8 * * *" = every day at 08:00 UTC

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use steward_core::error::{Result, StewardError};

/// How far ahead `next_after` searches before giving up (covers Feb 29).
const SEARCH_YEARS: i32 = 8;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// First value the names map to (JAN = 1, SUN = 0).
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], names_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], names_base: 0 };
const DAY_OF_MONTH: FieldSpec =
    FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 0 };
const MONTH: FieldSpec =
    FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, names_base: 1 };
// 7 is accepted as an alias for Sunday and folded into 0 after parsing.
const DAY_OF_WEEK: FieldSpec =
    FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAY_NAMES, names_base: 0 };

/// A validated cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    /// A field starting with '*' does not restrict the day (classic cron rule).
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a 5-field cron expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(StewardError::validation(format!(
                "invalid cron expression '{expression}': \
                 need 5 fields (MIN HOUR DOM MON DOW), got {}",
                parts.len()
            )));
        }

        let invalid = |e: String| {
            StewardError::validation(format!("invalid cron expression '{expression}': {e}"))
        };

        let mut days_of_week = parse_field(parts[4], DAY_OF_WEEK).map_err(invalid)?;
        if days_of_week.contains(7) {
            days_of_week.insert(0);
        }

        Ok(Self {
            expression: parts.join(" "),
            minutes: parse_field(parts[0], MINUTE).map_err(invalid)?,
            hours: parse_field(parts[1], HOUR).map_err(invalid)?,
            days_of_month: parse_field(parts[2], DAY_OF_MONTH).map_err(invalid)?,
            months: parse_field(parts[3], MONTH).map_err(invalid)?,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    /// Parse and make sure the schedule fires at least once after `now`.
    pub fn validate(expression: &str, now: DateTime<Utc>) -> Result<Self> {
        let schedule = Self::parse(expression)?;
        if schedule.next_after(now).is_none() {
            return Err(StewardError::validation(format!(
                "cron expression '{expression}' never fires"
            )));
        }
        Ok(schedule)
    }

    /// Normalized expression text.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Check whether the schedule fires in the minute containing `time`.
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        self.minutes.contains(time.minute())
            && self.hours.contains(time.hour())
            && self.months.contains(time.month())
            && self.day_matches(time.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First fire time strictly after `after`, at minute resolution.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let last_year = start.year() + SEARCH_YEARS;
        let mut t = start;

        while t.year() <= last_year {
            if !self.months.contains(t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronSchedule {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parse a cron field into the set of matching values.
fn parse_field(field: &str, spec: FieldSpec) -> std::result::Result<FieldSet, String> {
    let mut set = FieldSet(0);
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field '{field}'", spec.name));
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (base, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if base == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = base.split_once('-') {
            let a = parse_value(a, spec)?;
            let b = parse_value(b, spec)?;
            if a > b {
                return Err(format!("range {a}-{b} is reversed in {} field", spec.name));
            }
            (a, b)
        } else {
            let n = parse_value(base, spec)?;
            // "N/S" means from N to the end of the range.
            if step.is_some() { (n, spec.max) } else { (n, n) }
        };

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            set.insert(value);
        }
    }
    Ok(set)
}

fn parse_value(raw: &str, spec: FieldSpec) -> std::result::Result<u32, String> {
    let value = match raw.parse::<u32>() {
        Ok(n) => n,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(raw))
            .map(|i| i as u32 + spec.names_base)
            .ok_or_else(|| format!("invalid value '{raw}' in {} field", spec.name))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "value {value} out of range {}-{} in {} field",
            spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}
