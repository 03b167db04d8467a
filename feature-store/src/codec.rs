// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Offset-addressable feature files.
//!
//! Layout: bytes `[0, 4)` hold the little-endian `u32` record count, then
//! `count` little-endian `f32` values, one per calendar position.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use core_types::partition::sanitized_symbol;
use log::debug;
use memmap2::Mmap;

use crate::{
    calendar::CalendarIndex,
    error::{FeatureStoreError, Result},
    instruments::InstrumentList,
};

pub const HEADER_SIZE: u64 = 4;
pub const VALUE_WIDTH: u64 = 4;
pub const FEATURE_EXT: &str = "bin";

pub fn expected_len(count: u32) -> u64 {
    HEADER_SIZE + VALUE_WIDTH * count as u64
}

/// Single path component for a symbol or feature name: separators and
/// other unsafe characters become `_`, and names made only of dots cannot
/// step out of the store.
pub fn path_component(name: &str) -> String {
    let safe = sanitized_symbol(name);
    if safe.trim_matches('.').is_empty() {
        "_".repeat(safe.len().max(1))
    } else {
        safe
    }
}

/// Directory holding a symbol's feature files.
pub fn symbol_dir_name(symbol: &str) -> String {
    path_component(symbol).to_lowercase()
}

/// Directory tree of one binary feature store.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    root: PathBuf,
    market: String,
}

impl FeatureStore {
    pub fn new(root: impl Into<PathBuf>, market: &str) -> Self {
        Self {
            root: root.into(),
            market: market.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn market(&self) -> &str {
        &self.market
    }

    pub fn features_dir(&self) -> PathBuf {
        self.root.join("features")
    }

    pub fn feature_path(&self, symbol: &str, feature: &str) -> PathBuf {
        self.features_dir()
            .join(symbol_dir_name(symbol))
            .join(format!("{}.{FEATURE_EXT}", path_component(feature)))
    }

    pub fn calendar_path(&self) -> PathBuf {
        self.root
            .join("calendars")
            .join(format!("{}.txt", self.market))
    }

    pub fn instruments_path(&self) -> PathBuf {
        self.root.join("instruments").join("all.txt")
    }

    pub fn load_calendar(&self) -> Result<Option<CalendarIndex>> {
        CalendarIndex::load(&self.calendar_path())
    }

    pub fn publish_calendar(&self, calendar: &CalendarIndex) -> Result<()> {
        calendar.publish(&self.market, &self.calendar_path())
    }

    pub fn load_instruments(&self) -> Result<InstrumentList> {
        InstrumentList::load(&self.instruments_path())
    }

    pub fn save_instruments(&self, list: &InstrumentList) -> Result<()> {
        list.save(&self.instruments_path())
    }

    /// Writes a complete feature file. `values[i]` belongs to
    /// `calendar.dates()[i]`; callers fill dates without an observation.
    pub fn write(
        &self,
        symbol: &str,
        feature: &str,
        calendar: &CalendarIndex,
        values: &[f32],
    ) -> Result<u64> {
        if values.len() != calendar.len() {
            return Err(FeatureStoreError::Misaligned {
                values: values.len(),
                dates: calendar.len(),
            });
        }
        let path = self.feature_path(symbol, feature);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(expected_len(values.len() as u32) as usize);
        buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for value in values {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        let tmp = path.with_extension("bin.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!("wrote {:?} ({} records)", path, values.len());
        Ok(buf.len() as u64)
    }

    /// Appends the values for calendar positions past the file's current
    /// count. The first `count` dates of `calendar` must equal the
    /// published calendar. The header is rewritten after the values land.
    pub fn extend(
        &self,
        symbol: &str,
        feature: &str,
        calendar: &CalendarIndex,
        tail: &[f32],
    ) -> Result<u64> {
        let path = self.feature_path(symbol, feature);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let count = read_count(&mut file, &path)?;
        let existing = count as usize;
        if calendar.len() < existing || calendar.len() - existing != tail.len() {
            return Err(FeatureStoreError::Misaligned {
                values: existing + tail.len(),
                dates: calendar.len(),
            });
        }
        let published = self
            .load_calendar()?
            .ok_or_else(|| FeatureStoreError::MissingCalendar {
                market: self.market.clone(),
            })?;
        if published.len() < existing {
            return Err(FeatureStoreError::CalendarPrefixMismatch {
                path,
                position: published.len(),
            });
        }
        let implied = &published.dates()[..existing];
        if let Some(position) = implied
            .iter()
            .zip(calendar.dates())
            .position(|(a, b)| a != b)
        {
            return Err(FeatureStoreError::CalendarPrefixMismatch { path, position });
        }
        if tail.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::with_capacity(tail.len() * VALUE_WIDTH as usize);
        for value in tail {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        file.seek(SeekFrom::Start(expected_len(count)))?;
        file.write_all(&buf)?;
        file.sync_data()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&(calendar.len() as u32).to_le_bytes())?;
        file.sync_data()?;
        debug!("extended {:?} by {} records", path, tail.len());
        Ok(buf.len() as u64)
    }
}

/// Header count of an open feature file, checked against its length.
fn read_count(file: &mut File, path: &Path) -> Result<u32> {
    let actual = file.metadata()?.len();
    if actual < HEADER_SIZE {
        return Err(FeatureStoreError::CodecLengthMismatch {
            path: path.to_path_buf(),
            expected: HEADER_SIZE,
            actual,
        });
    }
    let mut header = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    let count = u32::from_le_bytes(header);
    if expected_len(count) != actual {
        return Err(FeatureStoreError::CodecLengthMismatch {
            path: path.to_path_buf(),
            expected: expected_len(count),
            actual,
        });
    }
    Ok(count)
}

/// Memory-mapped read access to one feature file.
pub struct FeatureReader {
    mmap: Mmap,
    count: usize,
}

impl FeatureReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let count = read_count(&mut file, path)? as usize;
        // Safety: feature files are replaced by rename or grown in place,
        // never truncated while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn value(&self, index: usize) -> Option<f32> {
        if index >= self.count {
            return None;
        }
        let start = HEADER_SIZE as usize + index * VALUE_WIDTH as usize;
        let bytes = self.mmap.get(start..start + VALUE_WIDTH as usize)?;
        Some(f32::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn values(&self) -> Vec<f32> {
        (0..self.count).filter_map(|i| self.value(i)).collect()
    }

    pub fn value_at(&self, calendar: &CalendarIndex, date: NaiveDate) -> Result<Option<f32>> {
        let index = calendar
            .position(date)
            .ok_or(FeatureStoreError::CalendarGap { date })?;
        Ok(self.value(index))
    }

    /// Values for calendar dates in `[start, end]` that the file covers.
    pub fn range(&self, calendar: &CalendarIndex, start: NaiveDate, end: NaiveDate) -> Vec<f32> {
        let from = calendar.dates().partition_point(|d| *d < start);
        let to = calendar.count_through(end).min(self.count);
        (from..to).filter_map(|i| self.value(i)).collect()
    }
}
