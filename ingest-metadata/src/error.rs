// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("watermark record {path:?} is unreadable: {source}")]
    CorruptWatermark {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
