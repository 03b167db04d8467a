// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Trading-day filtering over an externally supplied holiday list.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("no holiday data for market `{market}`")]
    UnknownMarket { market: String },
    #[error(
        "requested range {start}..={end} for market `{market}` falls outside known calendar {covered_start}..={covered_end}"
    )]
    Gap {
        market: String,
        start: NaiveDate,
        end: NaiveDate,
        covered_start: NaiveDate,
        covered_end: NaiveDate,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Supplier of non-trading dates for a market.
pub trait HolidaySource: Send + Sync {
    fn holidays(&self, market: &str) -> Result<BTreeSet<NaiveDate>, CalendarError>;

    /// Inclusive date range the holiday list is authoritative for. `None`
    /// means the source does not bound its coverage.
    fn coverage(&self, market: &str) -> Option<(NaiveDate, NaiveDate)>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHolidays {
    pub covered_start: NaiveDate,
    pub covered_end: NaiveDate,
    pub holidays: BTreeSet<NaiveDate>,
}

/// In-memory holiday table, optionally loaded from a JSON document keyed by
/// market name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticHolidays {
    markets: HashMap<String, MarketHolidays>,
}

impl StaticHolidays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_market(
        mut self,
        market: &str,
        covered_start: NaiveDate,
        covered_end: NaiveDate,
        holidays: impl IntoIterator<Item = NaiveDate>,
    ) -> Self {
        self.markets.insert(
            market.to_string(),
            MarketHolidays {
                covered_start,
                covered_end,
                holidays: holidays.into_iter().collect(),
            },
        );
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CalendarError> {
        let bytes = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl HolidaySource for StaticHolidays {
    fn holidays(&self, market: &str) -> Result<BTreeSet<NaiveDate>, CalendarError> {
        self.markets
            .get(market)
            .map(|m| m.holidays.clone())
            .ok_or_else(|| CalendarError::UnknownMarket {
                market: market.to_string(),
            })
    }

    fn coverage(&self, market: &str) -> Option<(NaiveDate, NaiveDate)> {
        self.markets
            .get(market)
            .map(|m| (m.covered_start, m.covered_end))
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Ordered trading dates in `[start, end]`: weekends and the source's
/// holidays removed. An empty range yields no dates.
pub fn trading_days(
    market: &str,
    start: NaiveDate,
    end: NaiveDate,
    source: &dyn HolidaySource,
) -> Result<Vec<NaiveDate>, CalendarError> {
    if start > end {
        return Ok(Vec::new());
    }
    if let Some((covered_start, covered_end)) = source.coverage(market) {
        if start < covered_start || end > covered_end {
            return Err(CalendarError::Gap {
                market: market.to_string(),
                start,
                end,
                covered_start,
                covered_end,
            });
        }
    }
    let holidays = source.holidays(market)?;
    Ok(start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| !is_weekend(*d) && !holidays.contains(d))
        .collect())
}
