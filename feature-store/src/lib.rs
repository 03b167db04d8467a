// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Per-symbol, per-feature binary columns addressed by trading-calendar
//! position, with the calendar and instrument sidecars and a validator.

pub mod calendar;
pub mod codec;
pub mod error;
pub mod instruments;
pub mod validator;

pub use calendar::CalendarIndex;
pub use codec::{FeatureReader, FeatureStore, HEADER_SIZE, VALUE_WIDTH};
pub use error::{FeatureStoreError, Result};
pub use instruments::{Instrument, InstrumentList};
pub use validator::{validate, ValidationReport, Violation, ViolationKind};
