// Copyright (c) James Kassemi, SC, US. All rights reserved.

use core_types::{PartitionKey, SchemaError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema mismatch for dataset `{dataset}`: {source}")]
    SchemaMismatch {
        dataset: String,
        #[source]
        source: SchemaError,
    },
    #[error("primary key conflict in {dataset}/{partition}: ({key})")]
    PrimaryKeyConflict {
        dataset: String,
        partition: PartitionKey,
        key: String,
    },
    #[error("partition {dataset}/{partition} not found")]
    NotFound {
        dataset: String,
        partition: PartitionKey,
    },
    #[error("rows for {found} cannot be written to partition {expected}")]
    PartitionMismatch {
        expected: PartitionKey,
        found: PartitionKey,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

impl StoreError {
    pub(crate) fn schema(dataset: &str, source: SchemaError) -> Self {
        StoreError::SchemaMismatch {
            dataset: dataset.to_string(),
            source,
        }
    }

    /// Transient failures a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}
