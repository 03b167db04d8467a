// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeatureStoreError>;

#[derive(Debug, Error)]
pub enum FeatureStoreError {
    #[error("{path:?} is {actual} bytes but its header implies {expected}")]
    CodecLengthMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("{values} values cannot be aligned to a calendar of {dates} dates")]
    Misaligned { values: usize, dates: usize },
    #[error("calendar prefix of {path:?} disagrees with the published calendar at position {position}")]
    CalendarPrefixMismatch { path: PathBuf, position: usize },
    #[error("calendar for `{market}` would rewrite published history at position {position}")]
    CalendarRewrite { market: String, position: usize },
    #[error("calendar dates must be strictly increasing ({previous} then {next})")]
    CalendarOrder { previous: NaiveDate, next: NaiveDate },
    #[error("date {date} is not in the calendar")]
    CalendarGap { date: NaiveDate },
    #[error("no published calendar for market `{market}`")]
    MissingCalendar { market: String },
    #[error("{path:?} line {line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("store has {violations} unresolved violation(s)")]
    Inconsistent { violations: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
