//! Time ranges, relative deltas, comparison offsets and grains.
//!
//! Relative phrases are anchored at midnight of the injected [`Clock`]'s
//! current day so that tests can pin "now".

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::data::parse_datetime;
use crate::sql::TruncUnit;

/// Source of the current instant
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// Clock pinned to one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeUnit {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let s = s.strip_suffix('s').unwrap_or(&s);
        match s {
            "second" => Some(TimeUnit::Second),
            "minute" => Some(TimeUnit::Minute),
            "hour" => Some(TimeUnit::Hour),
            "day" => Some(TimeUnit::Day),
            "week" => Some(TimeUnit::Week),
            "month" => Some(TimeUnit::Month),
            "quarter" => Some(TimeUnit::Quarter),
            "year" => Some(TimeUnit::Year),
            _ => None,
        }
    }
}

/// Signed calendar-aware delta; negative amounts point to the past
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeDelta {
    pub amount: i64,
    pub unit: TimeUnit,
}

fn delta_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*([+-]?)\s*(\d+)\s+(second|minute|hour|day|week|month|quarter|year)s?\s*(ago|later|before|after)?\s*$",
        )
        .ok()
    })
    .as_ref()
}

impl RelativeDelta {
    pub fn new(amount: i64, unit: TimeUnit) -> Self {
        Self { amount, unit }
    }

    /// Parse `N unit(s) ago|later`, `-N unit(s)` or `+N unit(s)`.
    ///
    /// A bare `N unit(s)` points to the past.
    pub fn parse(s: &str) -> Result<Self, TimeParseError> {
        let caps = delta_regex()
            .and_then(|re| re.captures(s))
            .ok_or_else(|| TimeParseError::InvalidDelta(s.to_string()))?;
        let magnitude: i64 = caps[2]
            .parse()
            .map_err(|_| TimeParseError::InvalidDelta(s.to_string()))?;
        let unit = TimeUnit::parse(&caps[3]).ok_or_else(|| TimeParseError::InvalidDelta(s.to_string()))?;
        let sign = &caps[1];
        let direction = caps.get(4).map(|m| m.as_str().to_lowercase());

        let amount = match direction.as_deref() {
            Some("ago" | "before") => -magnitude,
            Some(_) if sign == "-" => -magnitude,
            Some(_) => magnitude,
            None if sign == "+" => magnitude,
            None => -magnitude,
        };
        Ok(Self { amount, unit })
    }

    pub fn negate(&self) -> Self {
        Self {
            amount: -self.amount,
            unit: self.unit,
        }
    }

    pub fn apply(&self, dttm: NaiveDateTime) -> Option<NaiveDateTime> {
        let months = |factor: i64| {
            let n = self.amount.checked_mul(factor)?;
            let magnitude = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
            if n >= 0 {
                dttm.checked_add_months(magnitude)
            } else {
                dttm.checked_sub_months(magnitude)
            }
        };
        match self.unit {
            TimeUnit::Second => dttm.checked_add_signed(Duration::try_seconds(self.amount)?),
            TimeUnit::Minute => dttm.checked_add_signed(Duration::try_minutes(self.amount)?),
            TimeUnit::Hour => dttm.checked_add_signed(Duration::try_hours(self.amount)?),
            TimeUnit::Day => dttm.checked_add_signed(Duration::try_days(self.amount)?),
            TimeUnit::Week => dttm.checked_add_signed(Duration::try_weeks(self.amount)?),
            TimeUnit::Month => months(1),
            TimeUnit::Quarter => months(3),
            TimeUnit::Year => months(12),
        }
    }
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn first_of_quarter(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month0() / 3 * 3 + 1, 1).unwrap_or(date)
}

fn first_of_year(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date)
}

fn shifted(dttm: NaiveDateTime, amount: i64, unit: TimeUnit) -> Result<NaiveDateTime, TimeParseError> {
    RelativeDelta::new(amount, unit)
        .apply(dttm)
        .ok_or(TimeParseError::OutOfRange)
}

/// Resolved bounds of a time range; either side may be open
pub type TimeBounds = (Option<NaiveDateTime>, Option<NaiveDateTime>);

/// Resolve a human time range into absolute bounds.
///
/// Supports `No filter`, `Last <unit>`, `Last N <unit>s`, `Prior N <unit>s`,
/// `previous calendar week|month|year`, `Current <unit>` and `<since> : <until>`.
pub fn resolve_time_range(range: Option<&str>, now: NaiveDateTime) -> Result<TimeBounds, TimeParseError> {
    let Some(raw) = range.filter(|r| !r.trim().is_empty()) else {
        return Ok((None, None));
    };
    if let Some((since, until)) = raw.split_once(" : ") {
        return Ok((parse_endpoint(since, now)?, parse_endpoint(until, now)?));
    }

    let range = raw.trim();
    let lower = range.to_lowercase();
    let today = midnight(now.date());

    if lower == "no filter" {
        return Ok((None, None));
    }

    let words: Vec<&str> = lower.split_whitespace().collect();
    match words.as_slice() {
        ["last", unit] => {
            let unit = TimeUnit::parse(unit).ok_or_else(|| TimeParseError::InvalidRange(range.to_string()))?;
            Ok((Some(shifted(today, -1, unit)?), Some(today)))
        }
        ["last", n, unit] | ["prior", n, unit] => {
            let n: i64 = n.parse().map_err(|_| TimeParseError::InvalidRange(range.to_string()))?;
            let unit = TimeUnit::parse(unit).ok_or_else(|| TimeParseError::InvalidRange(range.to_string()))?;
            let anchor = if words[0] == "prior" { now } else { today };
            Ok((Some(shifted(anchor, -n, unit)?), Some(anchor)))
        }
        ["previous", "calendar", unit] => {
            let (start, unit) = match TimeUnit::parse(unit) {
                Some(TimeUnit::Week) => (monday_of(now.date()), TimeUnit::Week),
                Some(TimeUnit::Month) => (first_of_month(now.date()), TimeUnit::Month),
                Some(TimeUnit::Year) => (first_of_year(now.date()), TimeUnit::Year),
                _ => return Err(TimeParseError::InvalidRange(range.to_string())),
            };
            let end = midnight(start);
            Ok((Some(shifted(end, -1, unit)?), Some(end)))
        }
        ["current", unit] => {
            let date = now.date();
            let (start, unit) = match TimeUnit::parse(unit) {
                Some(TimeUnit::Day) => (date, TimeUnit::Day),
                Some(TimeUnit::Week) => (monday_of(date), TimeUnit::Week),
                Some(TimeUnit::Month) => (first_of_month(date), TimeUnit::Month),
                Some(TimeUnit::Quarter) => (first_of_quarter(date), TimeUnit::Quarter),
                Some(TimeUnit::Year) => (first_of_year(date), TimeUnit::Year),
                _ => return Err(TimeParseError::InvalidRange(range.to_string())),
            };
            let start = midnight(start);
            Ok((Some(start), Some(shifted(start, 1, unit)?)))
        }
        _ => Err(TimeParseError::InvalidRange(range.to_string())),
    }
}

fn parse_endpoint(part: &str, now: NaiveDateTime) -> Result<Option<NaiveDateTime>, TimeParseError> {
    let part = part.trim();
    let today = midnight(now.date());
    match part.to_lowercase().as_str() {
        "" => Ok(None),
        "now" => Ok(Some(now)),
        "today" => Ok(Some(today)),
        "yesterday" => Ok(Some(shifted(today, -1, TimeUnit::Day)?)),
        "tomorrow" => Ok(Some(shifted(today, 1, TimeUnit::Day)?)),
        _ => {
            if let Some(dttm) = parse_datetime(part) {
                return Ok(Some(dttm));
            }
            let delta = RelativeDelta::parse(part)
                .map_err(|_| TimeParseError::InvalidEndpoint(part.to_string()))?;
            delta.apply(today).map(Some).ok_or(TimeParseError::OutOfRange)
        }
    }
}

/// How an offset query's time axis is moved back onto the primary axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realign {
    Calendar(RelativeDelta),
    Fixed(Duration),
}

impl Realign {
    pub fn apply(&self, dttm: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Realign::Calendar(delta) => delta.apply(dttm),
            Realign::Fixed(duration) => dttm.checked_add_signed(*duration),
        }
    }
}

/// Window of a comparison query plus the shift realigning its results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftedWindow {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
    pub realign: Realign,
}

/// A "time comparison" offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeOffset {
    /// `1 year ago`, `-1 year`, `52 weeks ago`
    Relative(RelativeDelta),
    /// `2023-01-01 : 2023-01-31`
    DateRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    /// Offset by the length of the primary window
    Inherit,
    /// Offset so the comparison window starts on this date
    CustomDate(NaiveDate),
}

impl TimeOffset {
    pub fn parse(s: &str) -> Result<Self, TimeParseError> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("inherit") {
            return Ok(TimeOffset::Inherit);
        }
        if let Some((start, end)) = trimmed.split_once(" : ") {
            let start = parse_datetime(start).ok_or_else(|| TimeParseError::InvalidOffset(s.to_string()))?;
            let end = parse_datetime(end).ok_or_else(|| TimeParseError::InvalidOffset(s.to_string()))?;
            return Ok(TimeOffset::DateRange { start, end });
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Ok(TimeOffset::CustomDate(date));
        }
        RelativeDelta::parse(trimmed)
            .map(TimeOffset::Relative)
            .map_err(|_| TimeParseError::InvalidOffset(s.to_string()))
    }

    /// Compute the comparison window for a primary window
    pub fn shifted_window(
        &self,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    ) -> Result<ShiftedWindow, TimeParseError> {
        let (Some(from), Some(to)) = (from, to) else {
            return Err(TimeParseError::MissingWindow);
        };
        let fixed = |back: Duration| -> Result<ShiftedWindow, TimeParseError> {
            Ok(ShiftedWindow {
                from: from.checked_sub_signed(back).ok_or(TimeParseError::OutOfRange)?,
                to: to.checked_sub_signed(back).ok_or(TimeParseError::OutOfRange)?,
                realign: Realign::Fixed(back),
            })
        };
        match self {
            TimeOffset::Relative(delta) => Ok(ShiftedWindow {
                from: delta.apply(from).ok_or(TimeParseError::OutOfRange)?,
                to: delta.apply(to).ok_or(TimeParseError::OutOfRange)?,
                realign: Realign::Calendar(delta.negate()),
            }),
            TimeOffset::DateRange { start, end } => Ok(ShiftedWindow {
                from: *start,
                to: *end,
                realign: Realign::Fixed(from - *start),
            }),
            TimeOffset::Inherit => fixed(Duration::days((to - from).num_days())),
            TimeOffset::CustomDate(date) => fixed(Duration::days((from.date() - *date).num_days())),
        }
    }
}

/// Truncation grain of the temporal axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeGrain {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeGrain {
    /// Parse an ISO-8601 duration grain (`P1D`, `P1M`, ...) or a unit name
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PT1S" => Some(TimeGrain::Second),
            "PT1M" => Some(TimeGrain::Minute),
            "PT1H" => Some(TimeGrain::Hour),
            "P1D" => Some(TimeGrain::Day),
            "P1W" => Some(TimeGrain::Week),
            "P1M" => Some(TimeGrain::Month),
            "P3M" => Some(TimeGrain::Quarter),
            "P1Y" => Some(TimeGrain::Year),
            _ => TimeUnit::parse(s).map(|unit| match unit {
                TimeUnit::Second => TimeGrain::Second,
                TimeUnit::Minute => TimeGrain::Minute,
                TimeUnit::Hour => TimeGrain::Hour,
                TimeUnit::Day => TimeGrain::Day,
                TimeUnit::Week => TimeGrain::Week,
                TimeUnit::Month => TimeGrain::Month,
                TimeUnit::Quarter => TimeGrain::Quarter,
                TimeUnit::Year => TimeGrain::Year,
            }),
        }
    }

    pub fn trunc_unit(&self) -> TruncUnit {
        match self {
            TimeGrain::Second => TruncUnit::Second,
            TimeGrain::Minute => TruncUnit::Minute,
            TimeGrain::Hour => TruncUnit::Hour,
            TimeGrain::Day => TruncUnit::Day,
            TimeGrain::Week => TruncUnit::Week,
            TimeGrain::Month => TruncUnit::Month,
            TimeGrain::Quarter => TruncUnit::Quarter,
            TimeGrain::Year => TruncUnit::Year,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            TimeGrain::Second => "second",
            TimeGrain::Minute => "minute",
            TimeGrain::Hour => "hour",
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }

    /// Grains whose buckets have varying lengths
    pub fn is_calendar(&self) -> bool {
        matches!(
            self,
            TimeGrain::Week | TimeGrain::Month | TimeGrain::Quarter | TimeGrain::Year
        )
    }

    /// Join key for calendar grains: ISO week, month, quarter or year label
    pub fn grain_key(&self, dttm: NaiveDateTime) -> Option<String> {
        let date = dttm.date();
        match self {
            TimeGrain::Week => {
                let week = date.iso_week();
                Some(format!("{}-W{:02}", week.year(), week.week()))
            }
            TimeGrain::Month => Some(format!("{}-{:02}", date.year(), date.month())),
            TimeGrain::Quarter => Some(format!("{}-Q{}", date.year(), date.month0() / 3 + 1)),
            TimeGrain::Year => Some(format!("{}", date.year())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeParseError {
    #[error("Invalid time range: {0}")]
    InvalidRange(String),

    #[error("Invalid time range endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid time delta: {0}")]
    InvalidDelta(String),

    #[error("Invalid time offset: {0}")]
    InvalidOffset(String),

    #[error("Time offsets require a bounded time range")]
    MissingWindow,

    #[error("Date out of range")]
    OutOfRange,
}
