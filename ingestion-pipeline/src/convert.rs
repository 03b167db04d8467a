// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{collections::BTreeMap, sync::Arc};

use arrow::{
    array::{Array, Date32Array, Float64Array, StringArray},
    compute::cast,
    datatypes::DataType,
    record_batch::RecordBatch,
};
use chrono::NaiveDate;
use core_types::{types::days_to_date, DatasetSpec, EngineConfig, FillPolicy};
use feature_store::{CalendarIndex, FeatureReader, FeatureStore, FeatureStoreError};
use log::{debug, info, warn};
use partition_store::{PartitionedStore, StoreError};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionSummary {
    pub symbols: usize,
    pub files_written: usize,
    pub files_extended: usize,
    pub files_unchanged: usize,
    /// Rows dated before the first or after the last calendar date.
    pub rows_outside_calendar: usize,
    pub calendar_len: usize,
    pub bytes: u64,
}

/// Observations of one symbol: date -> one value per requested feature.
type SymbolRows = BTreeMap<NaiveDate, Vec<Option<f64>>>;

/// Turns stored partitions of a dataset into per-symbol feature files.
pub struct FeatureConverter {
    store: Arc<PartitionedStore>,
    features: FeatureStore,
    fill_policy: FillPolicy,
}

impl FeatureConverter {
    pub fn new(store: Arc<PartitionedStore>, features: FeatureStore, fill_policy: FillPolicy) -> Self {
        Self {
            store,
            features,
            fill_policy,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Arc::new(PartitionedStore::new(&config.data_root)),
            FeatureStore::new(&config.feature_root, &config.market),
            config.conversion.fill_policy,
        )
    }

    pub fn feature_store(&self) -> &FeatureStore {
        &self.features
    }

    /// Aligns every symbol of `spec` to the trading calendar and writes one
    /// file per requested feature. Files whose stored values still match are
    /// extended by their new tail only.
    pub fn convert(
        &self,
        spec: &DatasetSpec,
        features: &[&str],
        trading_days: &[NaiveDate],
    ) -> Result<ConversionSummary> {
        let symbol_column = spec
            .symbol_column
            .as_deref()
            .ok_or_else(|| PipelineError::NoSymbolColumn(spec.name.clone()))?;
        for &feature in features {
            if !spec.field(feature).is_some_and(|f| f.kind.is_numeric()) {
                return Err(PipelineError::UnknownFeature {
                    dataset: spec.name.clone(),
                    feature: feature.to_string(),
                });
            }
        }

        let calendar = self.resolve_calendar(trading_days)?;
        let mut summary = ConversionSummary {
            calendar_len: calendar.len(),
            ..ConversionSummary::default()
        };

        let mut by_symbol: BTreeMap<String, SymbolRows> = BTreeMap::new();
        for key in self.store.list_partitions(spec)? {
            let batch = self.store.read(spec, &key)?;
            summary.rows_outside_calendar +=
                collect_rows(spec, symbol_column, features, &batch, &calendar, &mut by_symbol)?;
        }
        if summary.rows_outside_calendar > 0 {
            warn!(
                "{}: {} row(s) dated outside the calendar were not converted",
                spec.name, summary.rows_outside_calendar
            );
        }

        let mut instruments = self.features.load_instruments()?;
        for (symbol, rows) in &by_symbol {
            let (Some(first), Some(last)) = (rows.keys().next(), rows.keys().next_back()) else {
                continue;
            };
            let (first, last) = (*first, *last);
            let active = calendar.truncated_through(last);
            for (idx, feature) in features.iter().enumerate() {
                let values = align(&active, first, rows, idx, self.fill_policy);
                self.store_feature(symbol, feature, &active, &values, &mut summary)?;
            }
            instruments.upsert(symbol, first, last);
            summary.symbols += 1;
        }
        self.features.save_instruments(&instruments)?;

        info!(
            "converted {} symbol(s) of {}: {} written, {} extended, {} unchanged ({} bytes)",
            summary.symbols,
            spec.name,
            summary.files_written,
            summary.files_extended,
            summary.files_unchanged,
            summary.bytes
        );
        Ok(summary)
    }

    /// The published calendar when `trading_days` adds nothing to it,
    /// otherwise `trading_days` published as its extension.
    fn resolve_calendar(&self, trading_days: &[NaiveDate]) -> Result<CalendarIndex> {
        let requested = CalendarIndex::from_unsorted(trading_days.to_vec());
        if let Some(published) = self.features.load_calendar()? {
            if published.len() >= requested.len() && published.first_divergence(&requested).is_none() {
                return Ok(published);
            }
        }
        self.features.publish_calendar(&requested)?;
        Ok(requested)
    }

    fn store_feature(
        &self,
        symbol: &str,
        feature: &str,
        calendar: &CalendarIndex,
        values: &[f32],
        summary: &mut ConversionSummary,
    ) -> Result<()> {
        let path = self.features.feature_path(symbol, feature);
        let stored = if path.is_file() {
            match FeatureReader::open(&path) {
                Ok(reader) => Some(reader.values()),
                Err(FeatureStoreError::CodecLengthMismatch { .. }) => {
                    warn!("{:?} is damaged; rewriting", path);
                    None
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };

        match stored {
            Some(existing) if existing.len() <= values.len() && same_bits(&existing, values) => {
                if existing.len() == values.len() {
                    summary.files_unchanged += 1;
                } else {
                    summary.bytes +=
                        self.features
                            .extend(symbol, feature, calendar, &values[existing.len()..])?;
                    summary.files_extended += 1;
                }
            }
            _ => {
                summary.bytes += self.features.write(symbol, feature, calendar, values)?;
                summary.files_written += 1;
            }
        }
        debug!("{} {}: {} value(s)", symbol, feature, values.len());
        Ok(())
    }
}

/// Prefix comparison by bit pattern so NaN placeholders compare equal.
fn same_bits(stored: &[f32], values: &[f32]) -> bool {
    stored
        .iter()
        .zip(values)
        .all(|(a, b)| a.to_bits() == b.to_bits())
}

/// Adds the rows of `batch` to `by_symbol`; later rows overwrite earlier
/// ones for the same date. Rows dated before or after the calendar are
/// counted and skipped; a row on a non-trading date inside it is an error.
fn collect_rows(
    spec: &DatasetSpec,
    symbol_column: &str,
    features: &[&str],
    batch: &RecordBatch,
    calendar: &CalendarIndex,
    by_symbol: &mut BTreeMap<String, SymbolRows>,
) -> Result<usize> {
    let missing = |column: &str| {
        StoreError::SchemaMismatch {
            dataset: spec.name.clone(),
            source: core_types::SchemaError::MissingColumn {
                column: column.to_string(),
            },
        }
    };
    let symbols = batch
        .column_by_name(symbol_column)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| missing(symbol_column))?;
    let dates = batch
        .column_by_name(&spec.date_column)
        .and_then(|c| c.as_any().downcast_ref::<Date32Array>())
        .ok_or_else(|| missing(&spec.date_column))?;
    let mut columns = Vec::with_capacity(features.len());
    for &feature in features {
        let column = batch
            .column_by_name(feature)
            .ok_or_else(|| missing(feature))?;
        columns.push(cast(column, &DataType::Float64).map_err(StoreError::from)?);
    }
    let columns: Vec<&Float64Array> = columns
        .iter()
        .filter_map(|c| c.as_any().downcast_ref::<Float64Array>())
        .collect();

    let span = calendar.first().zip(calendar.last());
    let mut outside = 0;
    for row in 0..batch.num_rows() {
        let Some(date) = days_to_date(dates.value(row)) else {
            outside += 1;
            continue;
        };
        if !calendar.contains(date) {
            if span.is_some_and(|(first, last)| first <= date && date <= last) {
                return Err(FeatureStoreError::CalendarGap { date }.into());
            }
            outside += 1;
            continue;
        }
        let values = columns
            .iter()
            .map(|c| (!c.is_null(row)).then(|| c.value(row)))
            .collect();
        by_symbol
            .entry(symbols.value(row).to_uppercase())
            .or_default()
            .insert(date, values);
    }
    Ok(outside)
}

/// One value per position of `calendar`: NaN before `first`, observations
/// where present, gaps filled per `policy`.
fn align(
    calendar: &CalendarIndex,
    first: NaiveDate,
    rows: &SymbolRows,
    feature: usize,
    policy: FillPolicy,
) -> Vec<f32> {
    let mut carried = f32::NAN;
    calendar
        .dates()
        .iter()
        .map(|date| {
            if *date < first {
                return f32::NAN;
            }
            match rows.get(date).and_then(|v| v[feature]) {
                Some(value) => {
                    carried = value as f32;
                    carried
                }
                None => match policy {
                    FillPolicy::Nan => f32::NAN,
                    FillPolicy::ForwardFill => carried,
                },
            }
        })
        .collect()
}
