// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Strongly typed rows for the built-in datasets.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Date32Array, Float64Array, Int64Array, StringArray, UInt64Array,
};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;

use crate::schema::{
    ConflictPolicy, DatasetSpec, FieldKind, FieldSpec, PartitionScheme, SchemaError, SkipPolicy,
};

pub const DAILY_DATASET: &str = "stocks_daily";
pub const MINUTE_DATASET: &str = "stocks_minute";

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Days since the unix epoch, the Arrow `Date32` representation.
pub fn date_to_days(date: NaiveDate) -> i32 {
    date.signed_duration_since(epoch()).num_days() as i32
}

pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    epoch().checked_add_signed(chrono::Duration::days(days as i64))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, spec: &DatasetSpec, name: &str) -> Result<&'a T, SchemaError> {
    let expected = spec
        .field(name)
        .map(|f| f.kind.data_type())
        .ok_or_else(|| SchemaError::MissingColumn {
            column: name.to_string(),
        })?;
    let array = batch
        .column_by_name(name)
        .ok_or_else(|| SchemaError::MissingColumn {
            column: name.to_string(),
        })?;
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| SchemaError::TypeMismatch {
            column: name.to_string(),
            expected,
            actual: array.data_type().clone(),
        })
}

fn date_value(array: &Date32Array, idx: usize) -> Result<NaiveDate, SchemaError> {
    days_to_date(array.value(idx)).ok_or_else(|| {
        SchemaError::Arrow(ArrowError::ComputeError(format!(
            "date32 value {} out of range",
            array.value(idx)
        )))
    })
}

fn optional<T, A>(array: &A, idx: usize, get: impl Fn(&A, usize) -> T) -> Option<T>
where
    A: Array,
{
    if array.is_null(idx) {
        None
    } else {
        Some(get(array, idx))
    }
}

/// End-of-day OHLCV aggregate for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub vwap: Option<f64>,
    pub transactions: Option<u64>,
}

impl DailyBar {
    pub fn spec() -> DatasetSpec {
        DatasetSpec {
            name: DAILY_DATASET.to_string(),
            version: 1,
            fields: vec![
                FieldSpec::required("symbol", FieldKind::Utf8),
                FieldSpec::required("date", FieldKind::Date),
                FieldSpec::required("open", FieldKind::Float64),
                FieldSpec::required("high", FieldKind::Float64),
                FieldSpec::required("low", FieldKind::Float64),
                FieldSpec::required("close", FieldKind::Float64),
                FieldSpec::required("volume", FieldKind::UInt64),
                FieldSpec::optional("vwap", FieldKind::Float64),
                FieldSpec::optional("transactions", FieldKind::UInt64),
            ],
            primary_key: vec!["symbol".to_string(), "date".to_string()],
            partition_scheme: PartitionScheme::YearMonth,
            date_column: "date".to_string(),
            symbol_column: Some("symbol".to_string()),
            conflict_policy: ConflictPolicy::KeepLast,
            skip_policy: SkipPolicy::Watermark,
        }
    }

    pub fn to_record_batch(rows: &[DailyBar]) -> Result<RecordBatch, ArrowError> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.symbol.as_str()))),
            Arc::new(Date32Array::from_iter_values(rows.iter().map(|r| date_to_days(r.date)))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.open))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.high))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.low))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.close))),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.volume))),
            Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.vwap))),
            Arc::new(UInt64Array::from_iter(rows.iter().map(|r| r.transactions))),
        ];
        RecordBatch::try_new(Self::spec().arrow_schema(), columns)
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Result<Vec<DailyBar>, SchemaError> {
        let spec = Self::spec();
        let symbol = column::<StringArray>(batch, &spec, "symbol")?;
        let date = column::<Date32Array>(batch, &spec, "date")?;
        let open = column::<Float64Array>(batch, &spec, "open")?;
        let high = column::<Float64Array>(batch, &spec, "high")?;
        let low = column::<Float64Array>(batch, &spec, "low")?;
        let close = column::<Float64Array>(batch, &spec, "close")?;
        let volume = column::<UInt64Array>(batch, &spec, "volume")?;
        let vwap = column::<Float64Array>(batch, &spec, "vwap")?;
        let transactions = column::<UInt64Array>(batch, &spec, "transactions")?;
        (0..batch.num_rows())
            .map(|i| {
                Ok(DailyBar {
                    symbol: symbol.value(i).to_string(),
                    date: date_value(date, i)?,
                    open: open.value(i),
                    high: high.value(i),
                    low: low.value(i),
                    close: close.value(i),
                    volume: volume.value(i),
                    vwap: optional(vwap, i, Float64Array::value),
                    transactions: optional(transactions, i, UInt64Array::value),
                })
            })
            .collect()
    }
}

/// One-minute OHLCV aggregate for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteBar {
    pub symbol: String,
    pub ts_ns: i64,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub transactions: Option<u64>,
}

impl MinuteBar {
    pub fn spec() -> DatasetSpec {
        DatasetSpec {
            name: MINUTE_DATASET.to_string(),
            version: 1,
            fields: vec![
                FieldSpec::required("symbol", FieldKind::Utf8),
                FieldSpec::required("ts_ns", FieldKind::Int64),
                FieldSpec::required("date", FieldKind::Date),
                FieldSpec::required("open", FieldKind::Float64),
                FieldSpec::required("high", FieldKind::Float64),
                FieldSpec::required("low", FieldKind::Float64),
                FieldSpec::required("close", FieldKind::Float64),
                FieldSpec::required("volume", FieldKind::UInt64),
                FieldSpec::optional("transactions", FieldKind::UInt64),
            ],
            primary_key: vec!["symbol".to_string(), "ts_ns".to_string()],
            partition_scheme: PartitionScheme::YearMonthDaySymbol,
            date_column: "date".to_string(),
            symbol_column: Some("symbol".to_string()),
            conflict_policy: ConflictPolicy::KeepLast,
            skip_policy: SkipPolicy::Existence,
        }
    }

    pub fn to_record_batch(rows: &[MinuteBar]) -> Result<RecordBatch, ArrowError> {
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.symbol.as_str()))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.ts_ns))),
            Arc::new(Date32Array::from_iter_values(rows.iter().map(|r| date_to_days(r.date)))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.open))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.high))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.low))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.close))),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.volume))),
            Arc::new(UInt64Array::from_iter(rows.iter().map(|r| r.transactions))),
        ];
        RecordBatch::try_new(Self::spec().arrow_schema(), columns)
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Result<Vec<MinuteBar>, SchemaError> {
        let spec = Self::spec();
        let symbol = column::<StringArray>(batch, &spec, "symbol")?;
        let ts_ns = column::<Int64Array>(batch, &spec, "ts_ns")?;
        let date = column::<Date32Array>(batch, &spec, "date")?;
        let open = column::<Float64Array>(batch, &spec, "open")?;
        let high = column::<Float64Array>(batch, &spec, "high")?;
        let low = column::<Float64Array>(batch, &spec, "low")?;
        let close = column::<Float64Array>(batch, &spec, "close")?;
        let volume = column::<UInt64Array>(batch, &spec, "volume")?;
        let transactions = column::<UInt64Array>(batch, &spec, "transactions")?;
        (0..batch.num_rows())
            .map(|i| {
                Ok(MinuteBar {
                    symbol: symbol.value(i).to_string(),
                    ts_ns: ts_ns.value(i),
                    date: date_value(date, i)?,
                    open: open.value(i),
                    high: high.value(i),
                    low: low.value(i),
                    close: close.value(i),
                    volume: volume.value(i),
                    transactions: optional(transactions, i, UInt64Array::value),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date32_conversion_matches_epoch_offsets() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(date_to_days(d), 19_724);
        assert_eq!(days_to_date(19_724), Some(d));
        assert_eq!(date_to_days(epoch()), 0);
    }

    #[test]
    fn minute_bars_keep_optional_nulls() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let rows = vec![
            MinuteBar {
                symbol: "SPY".to_string(),
                ts_ns: 1_704_205_800_000_000_000,
                date,
                open: 470.0,
                high: 471.0,
                low: 469.5,
                close: 470.5,
                volume: 12_000,
                transactions: None,
            },
            MinuteBar {
                symbol: "SPY".to_string(),
                ts_ns: 1_704_205_860_000_000_000,
                date,
                open: 470.5,
                high: 470.9,
                low: 470.1,
                close: 470.2,
                volume: 9_000,
                transactions: Some(88),
            },
        ];
        let batch = MinuteBar::to_record_batch(&rows).unwrap();
        assert_eq!(batch.column_by_name("transactions").unwrap().null_count(), 1);
        assert_eq!(MinuteBar::from_record_batch(&batch).unwrap(), rows);
    }
}
