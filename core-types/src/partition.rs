// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Hive-style partition keys: `year=YYYY/month=MM[/day=DD][/symbol=SYM]`.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{Datelike, NaiveDate};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
    pub day: Option<u32>,
    pub symbol: Option<String>,
}

impl PartitionKey {
    pub fn month(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: None,
            symbol: None,
        }
    }

    pub fn day(date: NaiveDate) -> Self {
        Self {
            day: Some(date.day()),
            ..Self::month(date)
        }
    }

    pub fn day_symbol(date: NaiveDate, symbol: &str) -> Self {
        Self {
            symbol: Some(sanitized_symbol(symbol)),
            ..Self::day(date)
        }
    }

    /// Date of the partition when it is day-granular.
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day?)
    }

    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(format!("year={:04}", self.year));
        path.push(format!("month={:02}", self.month));
        if let Some(day) = self.day {
            path.push(format!("day={:02}", day));
        }
        if let Some(symbol) = &self.symbol {
            path.push(format!("symbol={}", symbol));
        }
        path
    }

    /// Inverse of [`relative_path`](Self::relative_path).
    pub fn parse(relative: &Path) -> Option<Self> {
        let mut parts = relative.components().filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        });
        let year = parts.next()?.strip_prefix("year=")?.parse().ok()?;
        let month = parts.next()?.strip_prefix("month=")?.parse().ok()?;
        let mut key = Self {
            year,
            month,
            day: None,
            symbol: None,
        };
        for part in parts {
            if let Some(day) = part.strip_prefix("day=") {
                key.day = Some(day.parse().ok()?);
            } else if let Some(symbol) = part.strip_prefix("symbol=") {
                key.symbol = Some(symbol.to_string());
            } else {
                return None;
            }
        }
        if !(1..=12).contains(&key.month) {
            return None;
        }
        Some(key)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path().display())
    }
}

pub fn sanitized_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
