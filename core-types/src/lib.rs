// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Shared dataset schemas, typed rows, partition keys, trading-day filtering
//! and engine configuration for the ingestion and storage crates.

pub mod calendar;
pub mod config;
pub mod locks;
pub mod partition;
pub mod schema;
pub mod types;

pub use calendar::{trading_days, CalendarError, HolidaySource, StaticHolidays};
pub use crate::config::{ConfigError, EngineConfig, FillPolicy, ProcessingMode};
pub use locks::{KeyedGuard, KeyedLocks};
pub use partition::PartitionKey;
pub use schema::{
    ConflictPolicy, DatasetRegistry, DatasetSpec, FieldKind, FieldSpec, PartitionScheme,
    SchemaError, SkipPolicy,
};
pub use types::{DailyBar, MinuteBar};
