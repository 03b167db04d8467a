// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::path::PathBuf;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::NaiveDate;
use core_types::{partition::sanitized_symbol, DatasetSpec};
use partition_store::artifacts::read_record_batch;

use crate::error::BoxError;

/// Upstream supplier of raw rows for one date (and optional sub-key).
/// Retries and timeouts belong to the implementation.
#[async_trait]
pub trait RawSource: Send + Sync + 'static {
    async fn fetch(
        &self,
        dataset: &DatasetSpec,
        date: NaiveDate,
        sub_key: Option<&str>,
    ) -> Result<RecordBatch, BoxError>;
}

/// Reads downloaded landing files laid out as
/// `<root>/<dataset>/<YYYY-MM-DD>[_<sub-key>].parquet`.
#[derive(Clone)]
pub struct LandingParquetSource {
    root: PathBuf,
}

impl LandingParquetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn landing_path(&self, dataset: &str, date: NaiveDate, sub_key: Option<&str>) -> PathBuf {
        let stem = date.format("%Y-%m-%d").to_string();
        let name = match sub_key {
            Some(sub) => format!("{stem}_{}.parquet", sanitized_symbol(sub)),
            None => format!("{stem}.parquet"),
        };
        self.root.join(dataset).join(name)
    }
}

#[async_trait]
impl RawSource for LandingParquetSource {
    async fn fetch(
        &self,
        dataset: &DatasetSpec,
        date: NaiveDate,
        sub_key: Option<&str>,
    ) -> Result<RecordBatch, BoxError> {
        let path = self.landing_path(&dataset.name, date, sub_key);
        if !path.is_file() {
            return Err(format!("landing file {:?} not found", path).into());
        }
        let batch = tokio::task::spawn_blocking(move || read_record_batch(&path)).await??;
        Ok(batch)
    }
}
