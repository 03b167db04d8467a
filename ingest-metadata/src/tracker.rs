// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use core_types::{partition::sanitized_symbol, KeyedLocks};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{MetadataError, Result},
    event::{EventEntry, EventStats, IngestStatus, IngestionEvent, IngestionSummary},
};

const EVENT_EXT: &str = "event";
const DATE_FMT: &str = "%Y-%m-%d";

/// Result of a watermark update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkUpdate {
    Set {
        previous: Option<NaiveDate>,
        current: NaiveDate,
    },
    Unchanged(NaiveDate),
    /// The request would have moved the cursor backward without `force`.
    Rejected {
        current: NaiveDate,
        requested: NaiveDate,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkRecord {
    dataset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_key: Option<String>,
    date: NaiveDate,
    updated_at: DateTime<Utc>,
}

/// File-backed watermark cursors and per-key ingestion events under
/// `<metadata-root>/<dataset>/`.
pub struct WatermarkTracker {
    root: PathBuf,
    locks: KeyedLocks<PathBuf>,
}

impl WatermarkTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn event_path(&self, dataset: &str, date: NaiveDate, sub_key: Option<&str>) -> PathBuf {
        let name = match sub_key {
            Some(sub) => format!("{}_{}.{EVENT_EXT}", date.format(DATE_FMT), sanitized_symbol(sub)),
            None => format!("{}.{EVENT_EXT}", date.format(DATE_FMT)),
        };
        self.month_dir(dataset, date.year(), date.month()).join(name)
    }

    pub fn watermark_path(&self, dataset: &str, sub_key: Option<&str>) -> PathBuf {
        let name = match sub_key {
            Some(sub) => format!("watermark_{}.record", sanitized_symbol(sub)),
            None => "watermark.record".to_string(),
        };
        self.root.join(dataset).join(name)
    }

    fn month_dir(&self, dataset: &str, year: i32, month: u32) -> PathBuf {
        self.root
            .join(dataset)
            .join(format!("{year:04}"))
            .join(format!("{month:02}"))
    }

    /// Appends one event for `(dataset, date, sub_key)`. The most recent call
    /// for a key is its effective event; earlier lines are retained.
    pub fn record_event(
        &self,
        dataset: &str,
        date: NaiveDate,
        sub_key: Option<&str>,
        status: IngestStatus,
        stats: EventStats,
        error: Option<String>,
    ) -> Result<IngestionEvent> {
        let event = IngestionEvent {
            dataset: dataset.to_string(),
            date,
            sub_key: sub_key.map(str::to_string),
            status,
            stats,
            error,
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let path = self.event_path(dataset, date, sub_key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self.locks.lock(&path);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if ends_mid_line(&mut file)? {
            warn!("event file {:?} ends with a partial line; terminating it", path);
            file.write_all(b"\n")?;
        }
        file.write_all(&line)?;
        file.sync_data()?;
        debug!("recorded {:?} for {} {} {:?}", status, dataset, date, sub_key);
        Ok(event)
    }

    /// Effective event for one key, if any file exists for it.
    pub fn get_event(
        &self,
        dataset: &str,
        date: NaiveDate,
        sub_key: Option<&str>,
    ) -> Option<EventEntry> {
        let path = self.event_path(dataset, date, sub_key);
        path.is_file().then(|| decode_event_file(&path))
    }

    /// Events of `dataset` dated within `[start, end]`, for every sub-key,
    /// in date order. Directories are read as the iterator advances.
    pub fn list_events(&self, dataset: &str, start: NaiveDate, end: NaiveDate) -> EventIter {
        let mut months = VecDeque::new();
        if start <= end {
            let (mut year, mut month) = (start.year(), start.month());
            while (year, month) <= (end.year(), end.month()) {
                months.push_back(self.month_dir(dataset, year, month));
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
        }
        EventIter {
            months,
            pending: VecDeque::new(),
            start,
            end,
        }
    }

    pub fn summarize(&self, dataset: &str, start: NaiveDate, end: NaiveDate) -> IngestionSummary {
        let mut summary = IngestionSummary::default();
        for entry in self.list_events(dataset, start, end) {
            summary.add(&entry);
        }
        summary
    }

    /// Dates from `expected` without a success or skipped event.
    pub fn missing_dates(
        &self,
        dataset: &str,
        sub_key: Option<&str>,
        expected: &[NaiveDate],
    ) -> Vec<NaiveDate> {
        expected
            .iter()
            .copied()
            .filter(|date| {
                !matches!(
                    self.get_event(dataset, *date, sub_key),
                    Some(EventEntry::Event(ref e)) if e.status.is_terminal_success()
                )
            })
            .collect()
    }

    pub fn get_watermark(&self, dataset: &str, sub_key: Option<&str>) -> Result<Option<NaiveDate>> {
        let path = self.watermark_path(dataset, sub_key);
        Ok(read_watermark(&path)?.map(|r| r.date))
    }

    /// Compare-and-set of the cursor. Moving backward requires `force`;
    /// otherwise the request is logged and reported as rejected.
    pub fn set_watermark(
        &self,
        dataset: &str,
        sub_key: Option<&str>,
        date: NaiveDate,
        force: bool,
    ) -> Result<WatermarkUpdate> {
        let path = self.watermark_path(dataset, sub_key);
        let _guard = self.locks.lock(&path);
        let previous = read_watermark(&path)?.map(|r| r.date);
        match previous {
            Some(current) if current == date => return Ok(WatermarkUpdate::Unchanged(current)),
            Some(current) if current > date && !force => {
                warn!(
                    "rejected watermark regression for {}{}: {} -> {}",
                    dataset,
                    sub_key.map(|s| format!("/{s}")).unwrap_or_default(),
                    current,
                    date
                );
                return Ok(WatermarkUpdate::Rejected {
                    current,
                    requested: date,
                });
            }
            _ => {}
        }
        let record = WatermarkRecord {
            dataset: dataset.to_string(),
            sub_key: sub_key.map(str::to_string),
            date,
            updated_at: Utc::now(),
        };
        write_watermark(&path, &record)?;
        info!(
            "watermark for {}{} set to {} (was {:?})",
            dataset,
            sub_key.map(|s| format!("/{s}")).unwrap_or_default(),
            date,
            previous
        );
        Ok(WatermarkUpdate::Set {
            previous,
            current: date,
        })
    }

    /// Administrative override: sets the cursor to `date` regardless of
    /// direction, or clears it when `date` is `None`.
    pub fn reset_watermark(
        &self,
        dataset: &str,
        sub_key: Option<&str>,
        date: Option<NaiveDate>,
    ) -> Result<()> {
        match date {
            Some(date) => {
                self.set_watermark(dataset, sub_key, date, true)?;
            }
            None => {
                let path = self.watermark_path(dataset, sub_key);
                let _guard = self.locks.lock(&path);
                if path.exists() {
                    fs::remove_file(&path)?;
                    info!("cleared watermark {:?}", path);
                }
            }
        }
        Ok(())
    }
}

fn ends_mid_line(file: &mut File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn read_watermark(path: &Path) -> Result<Option<WatermarkRecord>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| MetadataError::CorruptWatermark {
            path: path.to_path_buf(),
            source,
        })
}

fn write_watermark(path: &Path, record: &WatermarkRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("record.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&serde_json::to_vec(record)?)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// The final line decides: it must be newline-terminated and decode.
fn decode_event_file(path: &Path) -> EventEntry {
    let malformed = |reason: String| {
        warn!("skipping malformed event file {:?}: {}", path, reason);
        EventEntry::Malformed {
            path: path.to_path_buf(),
            reason,
        }
    };
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => return malformed(err.to_string()),
    };
    if content.is_empty() {
        return malformed("empty file".to_string());
    }
    if !content.ends_with('\n') {
        return malformed("trailing partial line".to_string());
    }
    let last = content
        .trim_end_matches('\n')
        .rsplit('\n')
        .next()
        .unwrap_or_default();
    match serde_json::from_str::<IngestionEvent>(last) {
        Ok(event) => EventEntry::Event(event),
        Err(err) => malformed(format!("undecodable final line: {err}")),
    }
}

fn event_file_date(path: &Path) -> Option<NaiveDate> {
    if path.extension()?.to_str()? != EVENT_EXT {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (date, rest) = (stem.get(..10)?, stem.get(10..)?);
    if !(rest.is_empty() || rest.starts_with('_')) {
        return None;
    }
    NaiveDate::parse_from_str(date, DATE_FMT).ok()
}

/// Lazy walk over month directories of one dataset.
pub struct EventIter {
    months: VecDeque<PathBuf>,
    pending: VecDeque<PathBuf>,
    start: NaiveDate,
    end: NaiveDate,
}

impl EventIter {
    fn load_month(&mut self, dir: &Path) -> Option<EventEntry> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("cannot list event directory {:?}: {}", dir, err);
                return Some(EventEntry::Malformed {
                    path: dir.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                event_file_date(p).is_some_and(|d| d >= self.start && d <= self.end)
            })
            .collect();
        files.sort();
        self.pending.extend(files);
        None
    }
}

impl Iterator for EventIter {
    type Item = EventEntry;

    fn next(&mut self) -> Option<EventEntry> {
        loop {
            if let Some(path) = self.pending.pop_front() {
                return Some(decode_event_file(&path));
            }
            let dir = self.months.pop_front()?;
            if let Some(marker) = self.load_month(&dir) {
                return Some(marker);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn d(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn stats(records: u64) -> EventStats {
        EventStats {
            records,
            bytes: records * 10,
            partitions: 1,
            duplicates_dropped: 0,
        }
    }

    #[test]
    fn layout_matches_metadata_tree() {
        let tracker = WatermarkTracker::new("/meta");
        assert_eq!(
            tracker.event_path("stocks_minute", d(1, 2), Some("AAPL")),
            PathBuf::from("/meta/stocks_minute/2024/01/2024-01-02_AAPL.event")
        );
        assert_eq!(
            tracker.event_path("stocks_daily", d(11, 30), None),
            PathBuf::from("/meta/stocks_daily/2024/11/2024-11-30.event")
        );
        assert_eq!(
            tracker.watermark_path("stocks_minute", Some("AAPL")),
            PathBuf::from("/meta/stocks_minute/watermark_AAPL.record")
        );
        assert_eq!(
            tracker.watermark_path("stocks_daily", None),
            PathBuf::from("/meta/stocks_daily/watermark.record")
        );
    }

    #[test]
    fn later_event_wins_and_history_is_kept() {
        let dir = tempdir().unwrap();
        let tracker = WatermarkTracker::new(dir.path());
        tracker
            .record_event("stocks_daily", d(1, 2), None, IngestStatus::Failed, EventStats::default(), Some("timeout".into()))
            .unwrap();
        tracker
            .record_event("stocks_daily", d(1, 2), None, IngestStatus::Success, stats(5), None)
            .unwrap();
        let entry = tracker.get_event("stocks_daily", d(1, 2), None).unwrap();
        let event = entry.event().unwrap();
        assert_eq!(event.status, IngestStatus::Success);
        assert_eq!(event.stats.records, 5);
        let raw = fs::read_to_string(tracker.event_path("stocks_daily", d(1, 2), None)).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(tracker.get_event("stocks_daily", d(1, 3), None).is_none());
    }

    #[test]
    fn listing_skips_malformed_files_and_continues() {
        let dir = tempdir().unwrap();
        let tracker = WatermarkTracker::new(dir.path());
        tracker
            .record_event("stocks_daily", d(1, 2), None, IngestStatus::Success, stats(1), None)
            .unwrap();
        tracker
            .record_event("stocks_daily", d(2, 1), None, IngestStatus::Skipped, stats(0), None)
            .unwrap();
        let month = dir.path().join("stocks_daily/2024/01");
        fs::write(month.join("2024-01-03.event"), b"{\"dataset\":\"stocks_da").unwrap();
        fs::write(month.join("2024-01-04.event"), b"not json\n").unwrap();
        fs::write(month.join("notes.txt"), b"ignored").unwrap();

        let entries: Vec<EventEntry> = tracker.list_events("stocks_daily", d(1, 1), d(2, 28)).collect();
        assert_eq!(entries.len(), 4);
        let dates: Vec<NaiveDate> = entries.iter().filter_map(|e| e.event()).map(|e| e.date).collect();
        assert_eq!(dates, vec![d(1, 2), d(2, 1)]);
        assert!(matches!(entries[1], EventEntry::Malformed { .. }));
        assert!(matches!(entries[2], EventEntry::Malformed { .. }));

        let narrowed: Vec<EventEntry> = tracker.list_events("stocks_daily", d(1, 3), d(1, 31)).collect();
        assert_eq!(narrowed.len(), 2);
    }

    #[test]
    fn append_after_partial_line_recovers() {
        let dir = tempdir().unwrap();
        let tracker = WatermarkTracker::new(dir.path());
        let path = tracker.event_path("stocks_daily", d(1, 2), None);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{\"dataset\":").unwrap();
        assert!(matches!(
            tracker.get_event("stocks_daily", d(1, 2), None),
            Some(EventEntry::Malformed { .. })
        ));
        tracker
            .record_event("stocks_daily", d(1, 2), None, IngestStatus::Success, stats(2), None)
            .unwrap();
        let entry = tracker.get_event("stocks_daily", d(1, 2), None).unwrap();
        assert_eq!(entry.into_event().unwrap().status, IngestStatus::Success);
    }

    #[test]
    fn watermark_only_moves_forward_unless_forced() {
        let dir = tempdir().unwrap();
        let tracker = WatermarkTracker::new(dir.path());
        assert_eq!(tracker.get_watermark("stocks_daily", None).unwrap(), None);
        assert_eq!(
            tracker.set_watermark("stocks_daily", None, d(1, 5), false).unwrap(),
            WatermarkUpdate::Set { previous: None, current: d(1, 5) }
        );
        assert_eq!(
            tracker.set_watermark("stocks_daily", None, d(1, 3), false).unwrap(),
            WatermarkUpdate::Rejected { current: d(1, 5), requested: d(1, 3) }
        );
        assert_eq!(
            tracker.set_watermark("stocks_daily", None, d(1, 5), false).unwrap(),
            WatermarkUpdate::Unchanged(d(1, 5))
        );
        assert_eq!(tracker.get_watermark("stocks_daily", None).unwrap(), Some(d(1, 5)));

        tracker.reset_watermark("stocks_daily", None, Some(d(1, 1))).unwrap();
        assert_eq!(tracker.get_watermark("stocks_daily", None).unwrap(), Some(d(1, 1)));
        tracker.reset_watermark("stocks_daily", None, None).unwrap();
        assert_eq!(tracker.get_watermark("stocks_daily", None).unwrap(), None);
    }

    #[test]
    fn sub_key_watermarks_are_independent() {
        let dir = tempdir().unwrap();
        let tracker = WatermarkTracker::new(dir.path());
        tracker.set_watermark("stocks_minute", Some("AAPL"), d(3, 1), false).unwrap();
        tracker.set_watermark("stocks_minute", Some("MSFT"), d(2, 1), false).unwrap();
        assert_eq!(tracker.get_watermark("stocks_minute", Some("AAPL")).unwrap(), Some(d(3, 1)));
        assert_eq!(tracker.get_watermark("stocks_minute", Some("MSFT")).unwrap(), Some(d(2, 1)));
        assert_eq!(tracker.get_watermark("stocks_minute", None).unwrap(), None);
    }

    #[test]
    fn corrupt_watermark_is_an_error() {
        let dir = tempdir().unwrap();
        let tracker = WatermarkTracker::new(dir.path());
        let path = tracker.watermark_path("stocks_daily", None);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{").unwrap();
        assert!(matches!(
            tracker.get_watermark("stocks_daily", None),
            Err(MetadataError::CorruptWatermark { .. })
        ));
    }

    #[test]
    fn concurrent_updates_never_regress() {
        let dir = tempdir().unwrap();
        let tracker = Arc::new(WatermarkTracker::new(dir.path()));
        let days: Vec<u32> = vec![7, 3, 12, 1, 9, 15, 4, 11, 2, 14, 6, 10];
        std::thread::scope(|scope| {
            for day in &days {
                let tracker = Arc::clone(&tracker);
                let day = *day;
                scope.spawn(move || {
                    tracker.set_watermark("stocks_daily", None, d(1, day), false).unwrap();
                });
            }
        });
        assert_eq!(tracker.get_watermark("stocks_daily", None).unwrap(), Some(d(1, 15)));
    }

    #[test]
    fn concurrent_events_for_one_key_do_not_interleave() {
        let dir = tempdir().unwrap();
        let tracker = Arc::new(WatermarkTracker::new(dir.path()));
        std::thread::scope(|scope| {
            for i in 0..16u64 {
                let tracker = Arc::clone(&tracker);
                scope.spawn(move || {
                    tracker
                        .record_event("stocks_daily", d(1, 2), None, IngestStatus::Success, stats(i), None)
                        .unwrap();
                });
            }
        });
        let raw = fs::read_to_string(tracker.event_path("stocks_daily", d(1, 2), None)).unwrap();
        assert_eq!(raw.lines().count(), 16);
        for line in raw.lines() {
            serde_json::from_str::<IngestionEvent>(line).unwrap();
        }
    }

    #[test]
    fn summary_and_gaps() {
        let dir = tempdir().unwrap();
        let tracker = WatermarkTracker::new(dir.path());
        tracker.record_event("stocks_daily", d(1, 2), None, IngestStatus::Success, stats(10), None).unwrap();
        tracker.record_event("stocks_daily", d(1, 3), None, IngestStatus::Skipped, stats(0), None).unwrap();
        tracker
            .record_event("stocks_daily", d(1, 4), None, IngestStatus::Failed, EventStats::default(), Some("boom".into()))
            .unwrap();

        let summary = tracker.summarize("stocks_daily", d(1, 1), d(1, 31));
        assert_eq!((summary.success, summary.skipped, summary.failed), (1, 1, 1));
        assert_eq!(summary.total_records, 10);
        assert_eq!(summary.total_bytes, 100);
        assert!((summary.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        let missing = tracker.missing_dates("stocks_daily", None, &[d(1, 2), d(1, 3), d(1, 4), d(1, 5)]);
        assert_eq!(missing, vec![d(1, 4), d(1, 5)]);
    }
}
