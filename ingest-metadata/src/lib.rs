// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Watermarks and the append-only ingestion event log.

pub mod error;
pub mod event;
pub mod tracker;

pub use error::{MetadataError, Result};
pub use event::{EventEntry, EventStats, IngestStatus, IngestionEvent, IngestionSummary};
pub use tracker::{EventIter, WatermarkTracker, WatermarkUpdate};
