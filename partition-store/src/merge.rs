// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Primary-key deduplication for partition merges.

use std::collections::HashMap;

use arrow::{
    array::{ArrayRef, UInt32Array},
    compute::take_record_batch,
    record_batch::RecordBatch,
    row::{RowConverter, Rows, SortField},
    util::display::array_value_to_string,
};
use core_types::{ConflictPolicy, DatasetSpec, PartitionKey};

use crate::error::{Result, StoreError};

#[derive(Debug)]
pub struct Deduplicated {
    pub batch: RecordBatch,
    pub dropped: usize,
}

fn convert(batch: &RecordBatch, columns: &[usize]) -> Result<Rows> {
    let arrays: Vec<ArrayRef> = columns.iter().map(|&i| batch.column(i).clone()).collect();
    let fields = arrays
        .iter()
        .map(|a| SortField::new(a.data_type().clone()))
        .collect();
    let converter = RowConverter::new(fields)?;
    Ok(converter.convert_columns(&arrays)?)
}

fn render_key(batch: &RecordBatch, key_columns: &[usize], row: usize) -> String {
    key_columns
        .iter()
        .map(|&c| array_value_to_string(batch.column(c), row).unwrap_or_else(|_| "?".to_string()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Collapses rows sharing a primary key and orders the survivors by key.
///
/// Rows are taken in arrival order, so with [`ConflictPolicy::KeepLast`] the
/// later row replaces the earlier one. With [`ConflictPolicy::Reject`] exact
/// duplicates collapse silently and any differing duplicate is an error.
pub fn deduplicate(
    spec: &DatasetSpec,
    partition: &PartitionKey,
    batch: &RecordBatch,
) -> Result<Deduplicated> {
    let schema = batch.schema();
    let key_columns = spec
        .primary_key
        .iter()
        .map(|name| schema.index_of(name))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let keys = convert(batch, &key_columns)?;
    let full = match spec.conflict_policy {
        ConflictPolicy::Reject => {
            let all: Vec<usize> = (0..batch.num_columns()).collect();
            Some(convert(batch, &all)?)
        }
        ConflictPolicy::KeepLast => None,
    };

    let mut survivors: HashMap<_, usize> = HashMap::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let key = keys.row(row).owned();
        match (survivors.get(&key).copied(), &full) {
            (Some(prev), Some(full)) => {
                if full.row(prev) != full.row(row) {
                    return Err(StoreError::PrimaryKeyConflict {
                        dataset: spec.name.clone(),
                        partition: partition.clone(),
                        key: render_key(batch, &key_columns, row),
                    });
                }
            }
            _ => {
                survivors.insert(key, row);
            }
        }
    }

    let mut indices: Vec<u32> = survivors.into_values().map(|i| i as u32).collect();
    indices.sort_by(|&a, &b| keys.row(a as usize).cmp(&keys.row(b as usize)));
    let dropped = batch.num_rows() - indices.len();
    let batch = take_record_batch(batch, &UInt32Array::from(indices))?;
    Ok(Deduplicated { batch, dropped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use core_types::DailyBar;

    fn bar(symbol: &str, day: u32, close: f64) -> DailyBar {
        DailyBar {
            symbol: symbol.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 10,
            vwap: None,
            transactions: None,
        }
    }

    fn key() -> PartitionKey {
        PartitionKey::month(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    #[test]
    fn keep_last_prefers_later_rows_and_sorts_by_key() {
        let spec = DailyBar::spec();
        let batch = DailyBar::to_record_batch(&[
            bar("MSFT", 3, 1.0),
            bar("AAPL", 3, 1.0),
            bar("MSFT", 3, 9.0),
            bar("AAPL", 2, 5.0),
        ])
        .unwrap();
        let out = deduplicate(&spec, &key(), &batch).unwrap();
        assert_eq!(out.dropped, 1);
        assert_eq!(
            DailyBar::from_record_batch(&out.batch).unwrap(),
            vec![bar("AAPL", 2, 5.0), bar("AAPL", 3, 1.0), bar("MSFT", 3, 9.0)]
        );
    }

    #[test]
    fn reject_fails_on_differing_duplicates() {
        let mut spec = DailyBar::spec();
        spec.conflict_policy = ConflictPolicy::Reject;
        let batch =
            DailyBar::to_record_batch(&[bar("AAPL", 2, 1.0), bar("AAPL", 2, 2.0)]).unwrap();
        let err = deduplicate(&spec, &key(), &batch).unwrap_err();
        match err {
            StoreError::PrimaryKeyConflict { key, .. } => assert_eq!(key, "AAPL, 2024-01-02"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn reject_tolerates_identical_replays() {
        let mut spec = DailyBar::spec();
        spec.conflict_policy = ConflictPolicy::Reject;
        let batch =
            DailyBar::to_record_batch(&[bar("AAPL", 2, 1.0), bar("AAPL", 2, 1.0)]).unwrap();
        let out = deduplicate(&spec, &key(), &batch).unwrap();
        assert_eq!(out.batch.num_rows(), 1);
        assert_eq!(out.dropped, 1);
    }
}
