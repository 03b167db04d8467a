// Copyright (c) James Kassemi, SC, US. All rights reserved.

use chrono::NaiveDate;
use core_types::{CalendarError, SchemaError};
use feature_store::FeatureStoreError;
use ingest_metadata::MetadataError;
use partition_store::StoreError;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),
    #[error("invalid policy: {0}")]
    InvalidPolicy(#[source] SchemaError),
    #[error("dataset `{dataset}` has no numeric column `{feature}`")]
    UnknownFeature { dataset: String, feature: String },
    #[error("source returned rows dated {found} for {date}")]
    StrayRows { date: NaiveDate, found: String },
    #[error("source returned rows for `{found}` when asked for `{sub_key}` on {date}")]
    StraySymbol {
        date: NaiveDate,
        sub_key: String,
        found: String,
    },
    #[error("dataset `{0}` has no symbol column to convert by")]
    NoSymbolColumn(String),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    FeatureStore(#[from] FeatureStoreError),
}
