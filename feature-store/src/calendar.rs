// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{
    fs::{self, File},
    io::Write,
    path::Path,
};

use chrono::NaiveDate;
use log::info;

use crate::error::{FeatureStoreError, Result};

const DATE_FMT: &str = "%Y-%m-%d";

/// Ordered trading dates of one market. Position in this list is the
/// record offset inside every feature file of that market.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarIndex {
    dates: Vec<NaiveDate>,
}

impl CalendarIndex {
    pub fn new(dates: Vec<NaiveDate>) -> Result<Self> {
        for pair in dates.windows(2) {
            if pair[0] >= pair[1] {
                return Err(FeatureStoreError::CalendarOrder {
                    previous: pair[0],
                    next: pair[1],
                });
            }
        }
        Ok(Self { dates })
    }

    /// Sorts and deduplicates arbitrary input.
    pub fn from_unsorted(mut dates: Vec<NaiveDate>) -> Self {
        dates.sort_unstable();
        dates.dedup();
        Self { dates }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn first(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn position(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.position(date).is_some()
    }

    /// Number of calendar dates on or before `date`.
    pub fn count_through(&self, date: NaiveDate) -> usize {
        self.dates.partition_point(|d| *d <= date)
    }

    /// Leading dates through `date` inclusive.
    pub fn truncated_through(&self, date: NaiveDate) -> CalendarIndex {
        CalendarIndex {
            dates: self.dates[..self.count_through(date)].to_vec(),
        }
    }

    /// Position of the first date where `self` and `other` differ within
    /// their common length.
    pub fn first_divergence(&self, other: &CalendarIndex) -> Option<usize> {
        self.dates
            .iter()
            .zip(other.dates.iter())
            .position(|(a, b)| a != b)
    }

    /// A calendar file holds one ISO date per line.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        let mut dates = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let date = NaiveDate::parse_from_str(line, DATE_FMT).map_err(|err| {
                FeatureStoreError::Parse {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: err.to_string(),
                }
            })?;
            dates.push(date);
        }
        Self::new(dates).map(Some)
    }

    /// Writes the calendar for `market` to `path`. A published calendar only
    /// grows: the new one must start with every previously published date.
    pub fn publish(&self, market: &str, path: &Path) -> Result<()> {
        if let Some(existing) = Self::load(path)? {
            if let Some(position) = existing.first_divergence(self) {
                return Err(FeatureStoreError::CalendarRewrite {
                    market: market.to_string(),
                    position,
                });
            }
            if existing.len() > self.len() {
                return Err(FeatureStoreError::CalendarRewrite {
                    market: market.to_string(),
                    position: self.len(),
                });
            }
            if existing.len() == self.len() {
                return Ok(());
            }
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut body = String::with_capacity(self.len() * 11);
        for date in &self.dates {
            body.push_str(&date.format(DATE_FMT).to_string());
            body.push('\n');
        }
        let tmp = path.with_extension("txt.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        info!("published {} calendar with {} dates", market, self.len());
        Ok(())
    }
}
