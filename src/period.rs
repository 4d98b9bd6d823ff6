//! Calendar-month periods.
//!
//! A [`Period`] identifies one month of tenant data. It renders as a
//! zero-padded `YYYY-MM` string, which is also its storage form, so lexical
//! order of the stored text matches chronological order.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while parsing a period string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodParseError {
    #[error("period '{0}' must use the YYYY-MM format")]
    Format(String),
    #[error("period '{0}' has a month outside 01-12")]
    Month(String),
    #[error("period '{0}' has a year outside 1000-9999")]
    Year(String),
}

/// A single calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    /// Builds a period, returning `None` for an invalid month or year.
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
            return None;
        }
        Some(Self { year, month })
    }

    /// The period containing the given instant (UTC).
    pub fn containing(instant: DateTime<Utc>) -> Self {
        Self {
            year: instant.year(),
            month: instant.month(),
        }
    }

    /// The period containing the current instant.
    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// The following month.
    pub fn next(&self) -> Self {
        self.shifted(|first| first.checked_add_months(Months::new(1)))
    }

    /// The period `count` months earlier.
    pub fn months_before(&self, count: u32) -> Self {
        self.shifted(|first| first.checked_sub_months(Months::new(count)))
    }

    /// Number of months from `self` to `later`; negative when `later` precedes `self`.
    pub fn months_until(&self, later: &Period) -> i64 {
        let years = i64::from(later.year) - i64::from(self.year);
        years * 12 + i64::from(later.month) - i64::from(self.month)
    }

    /// Every period from `start` through `end`, ascending. Empty if `start > end`.
    pub fn range_inclusive(start: Period, end: Period) -> Vec<Period> {
        let mut periods = Vec::new();
        let mut cursor = start;
        while cursor <= end {
            periods.push(cursor);
            cursor = cursor.next();
        }
        periods
    }

    /// Moves the first day of this month with `shift`. Stays put when the
    /// result falls outside chrono's calendar.
    fn shifted(&self, shift: impl FnOnce(NaiveDate) -> Option<NaiveDate>) -> Self {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .and_then(shift)
            .map(|date| Self {
                year: date.year(),
                month: date.month(),
            })
            .unwrap_or(*self)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = PeriodParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (year, month) = trimmed
            .split_once('-')
            .filter(|(year, month)| year.len() == 4 && month.len() == 2)
            .ok_or_else(|| PeriodParseError::Format(value.to_string()))?;

        let year: i32 = year
            .parse()
            .map_err(|_| PeriodParseError::Format(value.to_string()))?;
        let month: u32 = month
            .parse()
            .map_err(|_| PeriodParseError::Format(value.to_string()))?;

        if !(1..=12).contains(&month) {
            return Err(PeriodParseError::Month(value.to_string()));
        }
        if !(1000..=9999).contains(&year) {
            return Err(PeriodParseError::Year(value.to_string()));
        }

        Ok(Self { year, month })
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
