// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use arrow::{
    array::{Array, Date32Array, StringArray, UInt32Array},
    compute::{concat_batches, take_record_batch},
    record_batch::RecordBatch,
};
use chrono::NaiveDate;
use core_types::{
    types::days_to_date, DatasetSpec, KeyedLocks, PartitionKey, PartitionScheme, SchemaError,
};
use log::{debug, info};

use crate::{
    artifacts::{read_record_batch, write_record_batch},
    error::{Result, StoreError},
    merge::deduplicate,
};

pub const PARTITION_FILE: &str = "data.parquet";

/// Outcome of one partition write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Rows offered by the caller.
    pub rows_in: usize,
    /// Rows in the partition after the write.
    pub rows_total: usize,
    /// Rows collapsed by primary-key deduplication.
    pub duplicates_dropped: usize,
    pub bytes: u64,
}

/// Partitioned parquet storage rooted at `<root>/<dataset>/<partition-key>/`.
///
/// Writes to one partition are serialized through a per-partition lock;
/// distinct partitions proceed independently.
pub struct PartitionedStore {
    root: PathBuf,
    locks: KeyedLocks<PathBuf>,
}

impl PartitionedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_root(&self, spec: &DatasetSpec) -> PathBuf {
        self.root.join(&spec.name)
    }

    pub fn partition_path(&self, spec: &DatasetSpec, key: &PartitionKey) -> PathBuf {
        self.dataset_root(spec)
            .join(key.relative_path())
            .join(PARTITION_FILE)
    }

    pub fn exists(&self, spec: &DatasetSpec, key: &PartitionKey) -> bool {
        self.partition_path(spec, key).is_file()
    }

    /// Whether any partition holds data for `date` (and `symbol`, when the
    /// scheme is symbol-keyed and one is given).
    pub fn has_partitions_for_date(
        &self,
        spec: &DatasetSpec,
        date: NaiveDate,
        symbol: Option<&str>,
    ) -> Result<bool> {
        match (spec.partition_scheme, symbol) {
            (PartitionScheme::YearMonthDaySymbol, None) => {
                let day_dir = self
                    .dataset_root(spec)
                    .join(PartitionKey::day(date).relative_path());
                if !day_dir.is_dir() {
                    return Ok(false);
                }
                for entry in fs::read_dir(day_dir)? {
                    if entry?.path().join(PARTITION_FILE).is_file() {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            (scheme, symbol) => {
                let key = scheme
                    .key_for(date, symbol)
                    .map_err(|e| StoreError::schema(&spec.name, e))?;
                Ok(self.exists(spec, &key))
            }
        }
    }

    /// Replaces the partition with `rows`.
    pub fn write(
        &self,
        spec: &DatasetSpec,
        key: &PartitionKey,
        rows: &RecordBatch,
    ) -> Result<WriteStats> {
        let incoming = self.prepare(spec, key, rows)?;
        let path = self.partition_path(spec, key);
        let _guard = self.locks.lock(&path);
        self.persist(spec, key, &path, incoming, rows.num_rows())
    }

    /// Appends `rows` to the partition, deduplicating on the primary key.
    pub fn merge(
        &self,
        spec: &DatasetSpec,
        key: &PartitionKey,
        rows: &RecordBatch,
    ) -> Result<WriteStats> {
        let incoming = self.prepare(spec, key, rows)?;
        let path = self.partition_path(spec, key);
        let _guard = self.locks.lock(&path);
        let combined = if path.is_file() {
            let existing = self.read_conformed(spec, &path)?;
            debug!(
                "merging {} rows into {}/{} ({} existing)",
                incoming.num_rows(),
                spec.name,
                key,
                existing.num_rows()
            );
            concat_batches(&spec.arrow_schema(), &[existing, incoming])?
        } else {
            incoming
        };
        self.persist(spec, key, &path, combined, rows.num_rows())
    }

    pub fn read(&self, spec: &DatasetSpec, key: &PartitionKey) -> Result<RecordBatch> {
        let path = self.partition_path(spec, key);
        if !path.is_file() {
            return Err(StoreError::NotFound {
                dataset: spec.name.clone(),
                partition: key.clone(),
            });
        }
        self.read_conformed(spec, &path)
    }

    /// All partition keys of the dataset, ordered.
    pub fn list_partitions(&self, spec: &DatasetSpec) -> Result<Vec<PartitionKey>> {
        let root = self.dataset_root(spec);
        let mut keys = Vec::new();
        if root.is_dir() {
            collect_partitions(&root, &root, &mut keys)?;
        }
        keys.sort();
        Ok(keys)
    }

    /// Concatenation of every partition of the dataset.
    pub fn read_all(&self, spec: &DatasetSpec) -> Result<RecordBatch> {
        let mut batches = Vec::new();
        for key in self.list_partitions(spec)? {
            batches.push(self.read(spec, &key)?);
        }
        Ok(concat_batches(&spec.arrow_schema(), &batches)?)
    }

    fn prepare(
        &self,
        spec: &DatasetSpec,
        key: &PartitionKey,
        rows: &RecordBatch,
    ) -> Result<RecordBatch> {
        let conformed = spec
            .conform(rows)
            .map_err(|e| StoreError::schema(&spec.name, e))?;
        for (found, _) in split_by_partition(spec, &conformed)? {
            if &found != key {
                return Err(StoreError::PartitionMismatch {
                    expected: key.clone(),
                    found,
                });
            }
        }
        Ok(conformed)
    }

    fn read_conformed(&self, spec: &DatasetSpec, path: &Path) -> Result<RecordBatch> {
        let batch = read_record_batch(path)?;
        spec.conform(&batch)
            .map_err(|e| StoreError::schema(&spec.name, e))
    }

    fn persist(
        &self,
        spec: &DatasetSpec,
        key: &PartitionKey,
        path: &Path,
        batch: RecordBatch,
        rows_in: usize,
    ) -> Result<WriteStats> {
        let deduped = deduplicate(spec, key, &batch)?;
        let bytes = write_record_batch(path, &deduped.batch)?;
        info!(
            "wrote {}/{} ({} rows, {} bytes)",
            spec.name,
            key,
            deduped.batch.num_rows(),
            bytes
        );
        Ok(WriteStats {
            rows_in,
            rows_total: deduped.batch.num_rows(),
            duplicates_dropped: deduped.dropped,
            bytes,
        })
    }
}

fn collect_partitions(root: &Path, dir: &Path, out: &mut Vec<PartitionKey>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if path.join(PARTITION_FILE).is_file() {
            if let Some(key) = path
                .strip_prefix(root)
                .ok()
                .and_then(PartitionKey::parse)
            {
                out.push(key);
                continue;
            }
        }
        collect_partitions(root, &path, out)?;
    }
    Ok(())
}

/// Groups the rows of a conformed batch by the partition each row belongs
/// to, derived from the dataset's date and symbol columns.
pub fn split_by_partition(
    spec: &DatasetSpec,
    batch: &RecordBatch,
) -> Result<Vec<(PartitionKey, RecordBatch)>> {
    let schema_err = |e: SchemaError| StoreError::schema(&spec.name, e);
    let dates = batch
        .column_by_name(&spec.date_column)
        .and_then(|c| c.as_any().downcast_ref::<Date32Array>())
        .ok_or_else(|| {
            schema_err(SchemaError::MissingColumn {
                column: spec.date_column.clone(),
            })
        })?;
    let symbols = match (&spec.symbol_column, spec.partition_scheme.requires_symbol()) {
        (Some(column), true) => Some(
            batch
                .column_by_name(column)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| {
                    schema_err(SchemaError::MissingColumn {
                        column: column.clone(),
                    })
                })?,
        ),
        _ => None,
    };

    let mut groups: BTreeMap<PartitionKey, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let days = dates.value(row);
        let date = days_to_date(days).ok_or_else(|| {
            StoreError::Arrow(arrow::error::ArrowError::ComputeError(format!(
                "date32 value {days} out of range"
            )))
        })?;
        let symbol = symbols.map(|s| s.value(row));
        let key = spec
            .partition_scheme
            .key_for(date, symbol)
            .map_err(schema_err)?;
        groups.entry(key).or_default().push(row as u32);
    }

    groups
        .into_iter()
        .map(|(key, rows)| {
            let part = if rows.len() == batch.num_rows() {
                batch.clone()
            } else {
                take_record_batch(batch, &UInt32Array::from(rows))?
            };
            Ok((key, part))
        })
        .collect()
}
