// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Schema-enforced, atomically written parquet partitions.

pub mod artifacts;
pub mod error;
pub mod merge;
pub mod store;

pub use artifacts::{read_record_batch, write_record_batch, writer_properties};
pub use error::{Result, StoreError};
pub use store::{split_by_partition, PartitionedStore, WriteStats, PARTITION_FILE};
