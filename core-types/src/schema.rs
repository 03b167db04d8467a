// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Dataset schema registry.
//!
//! Every dataset type registers exactly one canonical field list. Incoming
//! batches are conformed against it at the storage boundary: a column whose
//! Arrow type differs from the registered type is rejected outright, never
//! cast. Conformed batches always carry the registry schema, so files written
//! by independent runs share a byte-identical schema.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DatasetOverrides;
use crate::partition::PartitionKey;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("column `{column}` missing from batch")]
    MissingColumn { column: String },
    #[error("unexpected column `{column}` not present in registered schema")]
    UnexpectedColumn { column: String },
    #[error("column `{column}` has type {actual}, registered type is {expected}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },
    #[error("column `{column}` is non-nullable but contains {nulls} null values")]
    NullViolation { column: String, nulls: usize },
    #[error("dataset `{dataset}` is invalid: {reason}")]
    InvalidSpec { dataset: String, reason: String },
    #[error("dataset `{dataset}` already registered")]
    DuplicateDataset { dataset: String },
    #[error("unknown dataset `{dataset}`")]
    UnknownDataset { dataset: String },
    #[error("partition scheme {scheme:?} requires a symbol")]
    MissingSymbol { scheme: PartitionScheme },
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

/// Semantic column type. Each kind maps to exactly one physical Arrow type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Utf8,
    Date,
    Int64,
    UInt64,
    Float64,
    Float32,
    Bool,
}

impl FieldKind {
    pub fn data_type(self) -> DataType {
        match self {
            FieldKind::Utf8 => DataType::Utf8,
            FieldKind::Date => DataType::Date32,
            FieldKind::Int64 => DataType::Int64,
            FieldKind::UInt64 => DataType::UInt64,
            FieldKind::Float64 => DataType::Float64,
            FieldKind::Float32 => DataType::Float32,
            FieldKind::Bool => DataType::Boolean,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            FieldKind::Int64 | FieldKind::UInt64 | FieldKind::Float64 | FieldKind::Float32
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
}

impl FieldSpec {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: false,
        }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: true,
        }
    }

    fn arrow_field(&self) -> Field {
        Field::new(self.name.as_str(), self.kind.data_type(), self.nullable)
    }
}

/// How rows of a dataset map onto physical partition files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionScheme {
    YearMonth,
    YearMonthDay,
    YearMonthDaySymbol,
}

impl PartitionScheme {
    pub fn is_day_granular(self) -> bool {
        !matches!(self, PartitionScheme::YearMonth)
    }

    pub fn requires_symbol(self) -> bool {
        matches!(self, PartitionScheme::YearMonthDaySymbol)
    }

    pub fn key_for(self, date: NaiveDate, symbol: Option<&str>) -> Result<PartitionKey, SchemaError> {
        match self {
            PartitionScheme::YearMonth => Ok(PartitionKey::month(date)),
            PartitionScheme::YearMonthDay => Ok(PartitionKey::day(date)),
            PartitionScheme::YearMonthDaySymbol => {
                let symbol = symbol.ok_or(SchemaError::MissingSymbol { scheme: self })?;
                Ok(PartitionKey::day_symbol(date, symbol))
            }
        }
    }
}

/// Resolution of duplicate primary keys during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The row that arrived last wins.
    KeepLast,
    /// Any duplicate key with differing content fails the merge.
    Reject,
}

/// Which history a non-forced run may skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Dates at or before the watermark are not dispatched.
    Watermark,
    /// A date whose partition already exists is reported skipped.
    Existence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    pub name: String,
    pub version: u32,
    pub fields: Vec<FieldSpec>,
    pub primary_key: Vec<String>,
    pub partition_scheme: PartitionScheme,
    pub date_column: String,
    pub symbol_column: Option<String>,
    pub conflict_policy: ConflictPolicy,
    pub skip_policy: SkipPolicy,
}

impl DatasetSpec {
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self.fields.iter().map(FieldSpec::arrow_field).collect();
        let metadata = HashMap::from([
            ("dataset".to_string(), self.name.clone()),
            ("schema_version".to_string(), self.version.to_string()),
        ]);
        Arc::new(Schema::new_with_metadata(fields, metadata))
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Numeric columns that are neither key nor partition columns.
    pub fn feature_columns(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.kind.is_numeric())
            .filter(|f| !self.primary_key.contains(&f.name))
            .map(|f| f.name.as_str())
            .collect()
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidSpec {
            dataset: self.name.clone(),
            reason,
        };
        if self.fields.is_empty() {
            return Err(invalid("no fields registered".to_string()));
        }
        for (idx, field) in self.fields.iter().enumerate() {
            if self.fields[..idx].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("duplicate field `{}`", field.name)));
            }
        }
        if self.primary_key.is_empty() {
            return Err(invalid("empty primary key".to_string()));
        }
        for column in &self.primary_key {
            match self.field(column) {
                Some(f) if !f.nullable => {}
                Some(_) => return Err(invalid(format!("primary key column `{column}` is nullable"))),
                None => return Err(invalid(format!("primary key column `{column}` not a field"))),
            }
        }
        match self.field(&self.date_column) {
            Some(f) if f.kind == FieldKind::Date && !f.nullable => {}
            _ => {
                return Err(invalid(format!(
                    "date column `{}` must be a non-null date field",
                    self.date_column
                )))
            }
        }
        if let Some(symbol) = &self.symbol_column {
            match self.field(symbol) {
                Some(f) if f.kind == FieldKind::Utf8 && !f.nullable => {}
                _ => {
                    return Err(invalid(format!(
                        "symbol column `{symbol}` must be a non-null utf8 field"
                    )))
                }
            }
        } else if self.partition_scheme.requires_symbol() {
            return Err(invalid("symbol partitioning without a symbol column".to_string()));
        }
        if self.skip_policy == SkipPolicy::Existence && !self.partition_scheme.is_day_granular() {
            return Err(invalid(
                "existence skipping requires a day-granular partition scheme".to_string(),
            ));
        }
        Ok(())
    }

    /// Checks `batch` against the registered fields and re-emits it with the
    /// canonical schema and column order.
    pub fn conform(&self, batch: &RecordBatch) -> Result<RecordBatch, SchemaError> {
        let incoming = batch.schema();
        if let Some(extra) = incoming
            .fields()
            .iter()
            .find(|f| self.field(f.name()).is_none())
        {
            return Err(SchemaError::UnexpectedColumn {
                column: extra.name().clone(),
            });
        }
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(self.fields.len());
        for spec in &self.fields {
            let idx = incoming
                .index_of(&spec.name)
                .map_err(|_| SchemaError::MissingColumn {
                    column: spec.name.clone(),
                })?;
            let column = batch.column(idx);
            let expected = spec.kind.data_type();
            if column.data_type() != &expected {
                return Err(SchemaError::TypeMismatch {
                    column: spec.name.clone(),
                    expected,
                    actual: column.data_type().clone(),
                });
            }
            if !spec.nullable && column.null_count() > 0 {
                return Err(SchemaError::NullViolation {
                    column: spec.name.clone(),
                    nulls: column.null_count(),
                });
            }
            columns.push(column.clone());
        }
        Ok(RecordBatch::try_new(self.arrow_schema(), columns)?)
    }

    pub fn empty_batch(&self) -> RecordBatch {
        RecordBatch::new_empty(self.arrow_schema())
    }
}

/// Process-wide mapping of dataset name to its canonical spec.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    specs: HashMap<String, Arc<DatasetSpec>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the daily and minute bar datasets.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for spec in [crate::types::DailyBar::spec(), crate::types::MinuteBar::spec()] {
            registry
                .specs
                .insert(spec.name.clone(), Arc::new(spec));
        }
        registry
    }

    pub fn register(&mut self, spec: DatasetSpec) -> Result<(), SchemaError> {
        spec.validate()?;
        if self.specs.contains_key(&spec.name) {
            return Err(SchemaError::DuplicateDataset { dataset: spec.name });
        }
        self.specs.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, dataset: &str) -> Option<Arc<DatasetSpec>> {
        self.specs.get(dataset).cloned()
    }

    pub fn require(&self, dataset: &str) -> Result<Arc<DatasetSpec>, SchemaError> {
        self.get(dataset).ok_or_else(|| SchemaError::UnknownDataset {
            dataset: dataset.to_string(),
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.specs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Applies per-dataset policy overrides from configuration.
    pub fn apply_overrides(
        &mut self,
        overrides: &HashMap<String, DatasetOverrides>,
    ) -> Result<(), SchemaError> {
        for (dataset, ov) in overrides {
            let entry = self
                .specs
                .get_mut(dataset)
                .ok_or_else(|| SchemaError::UnknownDataset {
                    dataset: dataset.clone(),
                })?;
            let mut updated = DatasetSpec::clone(entry);
            if let Some(policy) = ov.conflict_policy {
                updated.conflict_policy = policy;
            }
            if let Some(policy) = ov.skip_policy {
                updated.skip_policy = policy;
            }
            updated.validate()?;
            info!(
                "dataset {} policies: conflict={:?} skip={:?}",
                dataset, updated.conflict_policy, updated.skip_policy
            );
            *entry = Arc::new(updated);
        }
        Ok(())
    }
}
