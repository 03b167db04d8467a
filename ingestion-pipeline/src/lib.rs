// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Drives one dataset from raw source rows through partitioned storage and
//! watermark tracking, and converts stored partitions into the binary
//! feature store.

pub mod convert;
pub mod error;
pub mod pipeline;
pub mod source;

pub use convert::{ConversionSummary, FeatureConverter};
pub use error::{BoxError, PipelineError, Result};
pub use pipeline::{DateFailure, IngestionPipeline, RunRequest, RunSummary};
pub use source::{LandingParquetSource, RawSource};
