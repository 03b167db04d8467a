// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::Path,
};

use chrono::NaiveDate;

use crate::error::{FeatureStoreError, Result};

const DATE_FMT: &str = "%Y-%m-%d";
const DELISTED: &str = "delisted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub delisted: bool,
}

/// Symbols with feature files and their active date ranges. Entries are
/// never removed; a delisting only marks the entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentList {
    entries: BTreeMap<String, Instrument>,
}

impl InstrumentList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<&Instrument> {
        self.entries.get(&symbol.to_uppercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds the symbol or widens its active range to cover `[start, end]`.
    pub fn upsert(&mut self, symbol: &str, start: NaiveDate, end: NaiveDate) {
        let symbol = symbol.to_uppercase();
        self.entries
            .entry(symbol.clone())
            .and_modify(|i| {
                i.start = i.start.min(start);
                i.end = i.end.max(end);
            })
            .or_insert(Instrument {
                symbol,
                start,
                end,
                delisted: false,
            });
    }

    /// Returns false when the symbol is unknown.
    pub fn mark_delisted(&mut self, symbol: &str) -> bool {
        match self.entries.get_mut(&symbol.to_uppercase()) {
            Some(instrument) => {
                instrument.delisted = true;
                true
            }
            None => false,
        }
    }

    /// `SYMBOL\tSTART\tEND[\tdelisted]` per line.
    pub fn load(path: &Path) -> Result<Self> {
        let mut list = Self::new();
        if !path.is_file() {
            return Ok(list);
        }
        let text = fs::read_to_string(path)?;
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parse_err = |reason: String| FeatureStoreError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            };
            let fields: Vec<&str> = line.split('\t').collect();
            let (symbol, start, end, delisted) = match fields.as_slice() {
                [symbol, start, end] => (*symbol, *start, *end, false),
                [symbol, start, end, flag] if *flag == DELISTED => (*symbol, *start, *end, true),
                _ => return Err(parse_err(format!("unexpected layout `{line}`"))),
            };
            let date = |raw: &str| {
                NaiveDate::parse_from_str(raw, DATE_FMT).map_err(|e| parse_err(e.to_string()))
            };
            let instrument = Instrument {
                symbol: symbol.to_uppercase(),
                start: date(start)?,
                end: date(end)?,
                delisted,
            };
            list.entries.insert(instrument.symbol.clone(), instrument);
        }
        Ok(list)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut body = String::new();
        for i in self.entries.values() {
            body.push_str(&format!(
                "{}\t{}\t{}",
                i.symbol,
                i.start.format(DATE_FMT),
                i.end.format(DATE_FMT)
            ));
            if i.delisted {
                body.push('\t');
                body.push_str(DELISTED);
            }
            body.push('\n');
        }
        let tmp = path.with_extension("txt.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
