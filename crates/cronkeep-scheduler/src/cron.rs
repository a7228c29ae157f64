//! Five-field cron expressions: parsing, matching, and rendering.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each field is
//! either `*` or a set of integers. Supported fragments: `N`, `N-M`,
//! `N-M/S`, `*/S`, and comma-separated unions of those. The month and
//! day-of-week fields also take case-insensitive three-letter names
//! (`JAN`..`DEC`, `SUN`..`SAT`) wherever a number is allowed.
//!
//! A fragment that cannot be parsed empties its whole field, and an empty
//! field matches nothing and renders as `-`. Out-of-range literals are
//! dropped.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, SchedulerError};

const WEEKDAYS: [&str; 8] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

// ---------------------------------------------------------------------------
// Field
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Any,
    Values(BTreeSet<u32>),
}

impl Field {
    /// `names[i]` stands for `min + i`.
    fn parse(raw: &str, min: u32, max: u32, names: &[&str]) -> Self {
        if raw == "*" {
            return Field::Any;
        }

        let mut values = BTreeSet::new();
        for fragment in raw.split(',') {
            match parse_fragment(fragment, min, max, names) {
                Some(v) => values.extend(v),
                None => return Field::Values(BTreeSet::new()),
            }
        }
        Field::Values(values)
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Field::Any)
    }

    pub fn contains(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Values(set) => set.contains(&value),
        }
    }

    /// Compact rendering: consecutive runs collapse to `a-b`. An empty set
    /// renders as `-`, which parses back to an empty set.
    fn render(&self) -> String {
        let set = match self {
            Field::Any => return "*".to_string(),
            Field::Values(set) => set,
        };

        let mut parts: Vec<String> = Vec::new();
        let mut iter = set.iter().copied();
        let Some(first) = iter.next() else {
            return "-".to_string();
        };
        let (mut start, mut end) = (first, first);
        for v in iter {
            if v == end + 1 {
                end = v;
                continue;
            }
            parts.push(render_run(start, end));
            start = v;
            end = v;
        }
        parts.push(render_run(start, end));
        parts.join(",")
    }
}

fn render_run(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

/// A number, or a three-letter name from `names` (which start at `min`).
fn parse_value(token: &str, min: u32, names: &[&str]) -> Option<u32> {
    if let Ok(n) = token.parse() {
        return Some(n);
    }
    if token.len() != 3 {
        return None;
    }
    names
        .iter()
        .position(|name| name.get(..3).is_some_and(|abbr| abbr.eq_ignore_ascii_case(token)))
        .map(|i| min + i as u32)
}

/// Returns `None` when the fragment is malformed.
fn parse_fragment(fragment: &str, min: u32, max: u32, names: &[&str]) -> Option<Vec<u32>> {
    let (range, step) = match fragment.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().ok()?;
            if step == 0 {
                return None;
            }
            (range, Some(step))
        }
        None => (fragment, None),
    };

    let (lo, hi) = if range == "*" {
        // A bare `*` fragment inside a list is only meaningful with a step.
        step?;
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_value(a, min, names)?, parse_value(b, min, names)?)
    } else {
        let n = parse_value(range, min, names)?;
        if step.is_some() {
            return None;
        }
        (n, n)
    };

    let step = step.unwrap_or(1) as usize;
    Some(
        (lo.max(min)..=hi.min(max))
            .step_by(step)
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// CronKind
// ---------------------------------------------------------------------------

/// Coarse classification of a schedule by which fields are restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronKind {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
    Undefined,
}

impl fmt::Display for CronKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CronKind::Minute => "minute",
            CronKind::Hour => "hour",
            CronKind::Day => "day",
            CronKind::Week => "week",
            CronKind::Month => "month",
            CronKind::Year => "year",
            CronKind::Undefined => "undefined",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// CronSpec
// ---------------------------------------------------------------------------

/// A parsed, immutable cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    source: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSpec {
    /// Parse a 5-field expression. Only the field count is validated;
    /// malformed fields parse to an empty set.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidCron(format!(
                "expected 5 fields, got {} in '{expression}'",
                fields.len()
            )));
        }

        Ok(Self {
            source: fields.join(" "),
            minute: Field::parse(fields[0], 0, 59, &[]),
            hour: Field::parse(fields[1], 0, 23, &[]),
            day_of_month: Field::parse(fields[2], 1, 31, &[]),
            month: Field::parse(fields[3], 1, 12, &MONTHS),
            day_of_week: Field::parse(fields[4], 0, 7, &WEEKDAYS),
        })
    }

    /// `* * * * *`
    pub fn every_minute() -> Self {
        Self {
            source: "* * * * *".to_string(),
            minute: Field::Any,
            hour: Field::Any,
            day_of_month: Field::Any,
            month: Field::Any,
            day_of_week: Field::Any,
        }
    }

    /// The expression as written, whitespace normalised.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn minute(&self) -> &Field {
        &self.minute
    }

    pub fn hour(&self) -> &Field {
        &self.hour
    }

    pub fn day_of_month(&self) -> &Field {
        &self.day_of_month
    }

    pub fn month(&self) -> &Field {
        &self.month
    }

    pub fn day_of_week(&self) -> &Field {
        &self.day_of_week
    }

    /// True when `t` falls inside this schedule (seconds are ignored).
    ///
    /// When both day-of-month and day-of-week are restricted, matching
    /// either one is enough.
    pub fn is_due<T: Datelike + Timelike>(&self, t: &T) -> bool {
        if !(self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.month.contains(t.month()))
        {
            return false;
        }

        let dom = self.day_of_month.contains(t.day());
        let weekday = t.weekday().num_days_from_sunday();
        let dow = self.day_of_week.contains(weekday)
            || (weekday == 0 && self.day_of_week.contains(7));

        match (self.day_of_month.is_any(), self.day_of_week.is_any()) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// True if any whole minute in `[at - before, at + after]` is due.
    pub fn matches_within_margin(&self, at: DateTime<Utc>, before: u32, after: u32) -> bool {
        let start = at - Duration::minutes(i64::from(before));
        (0..=i64::from(before) + i64::from(after))
            .any(|i| self.is_due(&(start + Duration::minutes(i))))
    }

    /// Re-render the parsed sets, e.g. `10-30/5 12 * * *` → `10,15,20,25,30 12 * * *`.
    pub fn expression(&self) -> String {
        [
            &self.minute,
            &self.hour,
            &self.day_of_month,
            &self.month,
            &self.day_of_week,
        ]
        .iter()
        .map(|f| f.render())
        .collect::<Vec<_>>()
        .join(" ")
    }

    pub fn kind(&self) -> CronKind {
        let mask: String = [
            &self.minute,
            &self.hour,
            &self.day_of_month,
            &self.month,
            &self.day_of_week,
        ]
        .iter()
        .map(|f| if f.is_any() { '*' } else { '-' })
        .collect();

        if mask == "*****" {
            CronKind::Minute
        } else if mask == "-****" {
            CronKind::Hour
        } else if mask.ends_with("***") {
            CronKind::Day
        } else if mask.ends_with("-**") {
            CronKind::Month
        } else if mask.ends_with("**-") {
            CronKind::Week
        } else if mask.ends_with("-*") {
            CronKind::Year
        } else {
            CronKind::Undefined
        }
    }

    /// English description, e.g. "Every day at 12:10,15,20,25,30".
    pub fn describe(&self) -> String {
        let kind = self.kind();
        if kind == CronKind::Undefined {
            return self.expression();
        }

        let mut parts = vec![format!("Every {kind}")];
        match kind {
            CronKind::Hour => {
                parts.push(format!("at {} minutes past the hour", self.minute.render()));
            }
            CronKind::Week => {
                parts.push(format!("on {}", self.named(&self.day_of_week, &WEEKDAYS, 0)));
            }
            CronKind::Month => {
                parts.push(format!("on the {}", self.day_of_month.render()));
            }
            CronKind::Year => {
                parts.push(format!("on the {}", self.day_of_month.render()));
                parts.push(format!("of {}", self.named(&self.month, &MONTHS, 1)));
            }
            _ => {}
        }
        if matches!(
            kind,
            CronKind::Day | CronKind::Week | CronKind::Month | CronKind::Year
        ) {
            parts.push(format!(
                "at {}:{}",
                pad(&self.hour.render()),
                pad(&self.minute.render())
            ));
        }

        parts.join(" ").replace('*', "-all-")
    }

    fn named(&self, field: &Field, names: &[&str], offset: u32) -> String {
        match field {
            Field::Any => "*".to_string(),
            Field::Values(set) if set.is_empty() => "-".to_string(),
            Field::Values(set) => set
                .iter()
                .filter_map(|v| names.get((v - offset) as usize).copied())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

fn pad(rendered: &str) -> String {
    match rendered.parse::<u32>() {
        Ok(n) => format!("{n:02}"),
        Err(_) => rendered.to_string(),
    }
}

impl FromStr for CronSpec {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression())
    }
}

impl Serialize for CronSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CronSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CronSpec::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
