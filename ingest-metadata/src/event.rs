// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    /// Output already existed; no work was done.
    Skipped,
    Failed,
}

impl IngestStatus {
    /// Success and skipped both count as completed work.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, IngestStatus::Success | IngestStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    #[serde(default)]
    pub records: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub partitions: u32,
    #[serde(default)]
    pub duplicates_dropped: u64,
}

impl EventStats {
    pub fn accumulate(&mut self, other: &EventStats) {
        self.records += other.records;
        self.bytes += other.bytes;
        self.partitions += other.partitions;
        self.duplicates_dropped += other.duplicates_dropped;
    }
}

/// One line of an `.event` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionEvent {
    pub dataset: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_key: Option<String>,
    pub status: IngestStatus,
    #[serde(default)]
    pub stats: EventStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Item of an event listing. Files that cannot be decoded are surfaced as
/// markers instead of failing the listing.
#[derive(Debug, Clone, PartialEq)]
pub enum EventEntry {
    Event(IngestionEvent),
    Malformed { path: PathBuf, reason: String },
}

impl EventEntry {
    pub fn event(&self) -> Option<&IngestionEvent> {
        match self {
            EventEntry::Event(event) => Some(event),
            EventEntry::Malformed { .. } => None,
        }
    }

    pub fn into_event(self) -> Option<IngestionEvent> {
        match self {
            EventEntry::Event(event) => Some(event),
            EventEntry::Malformed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionSummary {
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub malformed: usize,
    pub total_records: u64,
    pub total_bytes: u64,
}

impl IngestionSummary {
    pub fn total(&self) -> usize {
        self.success + self.skipped + self.failed
    }

    /// Share of decoded events that completed, counting skipped as success.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.success + self.skipped) as f64 / total as f64,
        }
    }

    pub(crate) fn add(&mut self, entry: &EventEntry) {
        let event = match entry {
            EventEntry::Event(event) => event,
            EventEntry::Malformed { .. } => {
                self.malformed += 1;
                return;
            }
        };
        match event.status {
            IngestStatus::Success => self.success += 1,
            IngestStatus::Skipped => self.skipped += 1,
            IngestStatus::Failed => self.failed += 1,
        }
        self.total_records += event.stats.records;
        self.total_bytes += event.stats.bytes;
    }
}
