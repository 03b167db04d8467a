// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    io::Read,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use log::{info, warn};

use crate::{
    calendar::CalendarIndex,
    codec::{expected_len, symbol_dir_name, FeatureStore, FEATURE_EXT, HEADER_SIZE},
    error::{FeatureStoreError, Result},
    instruments::Instrument,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// Byte length disagrees with the header count.
    LengthMismatch { expected: u64, actual: u64 },
    /// Record count differs from the calendar truncated at the symbol's
    /// last active date.
    RecordCountMismatch { expected: usize, actual: usize },
    /// File addresses positions past the end of the calendar.
    CalendarOverflow { records: usize, calendar_len: usize },
    /// Feature directory for a symbol absent from the instrument list.
    UnknownInstrument { symbol: String },
    /// Instrument range starts or ends on a date the calendar lacks.
    DateNotInCalendar { symbol: String, date: NaiveDate },
    /// Listed instrument without any feature file.
    MissingFeatures { symbol: String },
    MissingCalendar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.path.display(), self.kind)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub files_checked: usize,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Downstream readers must not consume a store with violations.
    pub fn ensure_consumable(&self) -> Result<()> {
        for violation in &self.violations {
            if let ViolationKind::LengthMismatch { expected, actual } = violation.kind {
                return Err(FeatureStoreError::CodecLengthMismatch {
                    path: violation.path.clone(),
                    expected,
                    actual,
                });
            }
        }
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(FeatureStoreError::Inconsistent {
                violations: self.violations.len(),
            })
        }
    }
}

fn header_count(path: &Path) -> Result<std::result::Result<u32, ViolationKind>> {
    let mut file = fs::File::open(path)?;
    let actual = file.metadata()?.len();
    if actual < HEADER_SIZE {
        return Ok(Err(ViolationKind::LengthMismatch {
            expected: HEADER_SIZE,
            actual,
        }));
    }
    let mut header = [0u8; HEADER_SIZE as usize];
    file.read_exact(&mut header)?;
    let count = u32::from_le_bytes(header);
    if expected_len(count) != actual {
        return Ok(Err(ViolationKind::LengthMismatch {
            expected: expected_len(count),
            actual,
        }));
    }
    Ok(Ok(count))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}

/// Checks every feature file against its header, the published calendar
/// and the instrument list. Reports; never repairs.
pub fn validate(store: &FeatureStore) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();
    let calendar = match store.load_calendar()? {
        Some(calendar) => calendar,
        None => {
            report.violations.push(Violation {
                path: store.calendar_path(),
                kind: ViolationKind::MissingCalendar,
            });
            CalendarIndex::default()
        }
    };
    let instruments = store.load_instruments()?;
    let instruments_path = store.instruments_path();

    for instrument in instruments.iter() {
        for date in [instrument.start, instrument.end] {
            if !calendar.is_empty() && !calendar.contains(date) {
                report.violations.push(Violation {
                    path: instruments_path.clone(),
                    kind: ViolationKind::DateNotInCalendar {
                        symbol: instrument.symbol.clone(),
                        date,
                    },
                });
            }
        }
    }

    // Feature directories are named by the sanitized symbol.
    let by_dir: BTreeMap<String, &Instrument> = instruments
        .iter()
        .map(|i| (symbol_dir_name(&i.symbol), i))
        .collect();
    let mut seen_dirs = BTreeSet::new();
    let features_dir = store.features_dir();
    if features_dir.is_dir() {
        for symbol_dir in sorted_entries(&features_dir)? {
            if !symbol_dir.is_dir() {
                continue;
            }
            let Some(dir_name) = symbol_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            seen_dirs.insert(dir_name.to_string());
            let instrument = by_dir.get(dir_name).copied();
            check_symbol(&mut report, &symbol_dir, dir_name, instrument, &calendar)?;
        }
    }

    for (dir_name, instrument) in &by_dir {
        if !seen_dirs.contains(dir_name) {
            report.violations.push(Violation {
                path: features_dir.join(dir_name),
                kind: ViolationKind::MissingFeatures {
                    symbol: instrument.symbol.clone(),
                },
            });
        }
    }

    if report.is_clean() {
        info!("feature store {:?}: {} files valid", store.root(), report.files_checked);
    } else {
        warn!(
            "feature store {:?}: {} violation(s) across {} files",
            store.root(),
            report.violations.len(),
            report.files_checked
        );
    }
    Ok(report)
}

fn check_symbol(
    report: &mut ValidationReport,
    symbol_dir: &Path,
    dir_name: &str,
    instrument: Option<&Instrument>,
    calendar: &CalendarIndex,
) -> Result<()> {
    if instrument.is_none() {
        report.violations.push(Violation {
            path: symbol_dir.to_path_buf(),
            kind: ViolationKind::UnknownInstrument {
                symbol: dir_name.to_uppercase(),
            },
        });
    }
    for path in sorted_entries(symbol_dir)? {
        if path.extension().and_then(|e| e.to_str()) != Some(FEATURE_EXT) {
            continue;
        }
        report.files_checked += 1;
        let records = match header_count(&path)? {
            Ok(count) => count as usize,
            Err(kind) => {
                report.violations.push(Violation { path, kind });
                continue;
            }
        };
        if !calendar.is_empty() && records > calendar.len() {
            report.violations.push(Violation {
                path,
                kind: ViolationKind::CalendarOverflow {
                    records,
                    calendar_len: calendar.len(),
                },
            });
            continue;
        }
        if let Some(instrument) = instrument {
            let expected = calendar.count_through(instrument.end);
            if records != expected {
                report.violations.push(Violation {
                    path,
                    kind: ViolationKind::RecordCountMismatch {
                        expected,
                        actual: records,
                    },
                });
            }
        }
    }
    Ok(())
}
