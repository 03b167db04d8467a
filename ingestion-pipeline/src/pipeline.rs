// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::sync::Arc;

use adaptive_scheduler::{
    AdaptiveScheduler, CancellationToken, ResourceSnapshot, SchedulerPolicy, WorkOutcome,
    WorkStatus,
};
use arrow::{
    array::{Array, Date32Array, StringArray},
    record_batch::RecordBatch,
};
use chrono::NaiveDate;
use core_types::{
    trading_days,
    types::{date_to_days, days_to_date},
    DatasetRegistry, DatasetSpec, EngineConfig, HolidaySource, ProcessingMode, SkipPolicy,
};
use ingest_metadata::{EventEntry, EventStats, IngestStatus, WatermarkTracker};
use log::{error, info, warn};
use partition_store::{split_by_partition, PartitionedStore, StoreError};

use crate::{
    error::{PipelineError, Result},
    source::RawSource,
};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub dataset: String,
    pub sub_key: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Reprocess dates at or before the watermark and ignore existing
    /// partitions.
    pub force_full: bool,
}

impl RunRequest {
    pub fn new(dataset: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            dataset: dataset.to_string(),
            sub_key: None,
            start,
            end,
            force_full: false,
        }
    }

    pub fn with_sub_key(mut self, sub_key: &str) -> Self {
        self.sub_key = Some(sub_key.to_string());
        self
    }

    pub fn force_full(mut self) -> Self {
        self.force_full = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DateFailure {
    pub date: NaiveDate,
    pub error: String,
}

/// Outcome of one run. `failed` and `cancelled` together are exactly the
/// dates a caller needs to retry.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub dataset: String,
    pub sub_key: Option<String>,
    pub mode: ProcessingMode,
    pub workers: usize,
    pub succeeded: Vec<NaiveDate>,
    pub skipped: Vec<NaiveDate>,
    pub failed: Vec<DateFailure>,
    pub cancelled: Vec<NaiveDate>,
    pub watermark_before: Option<NaiveDate>,
    pub watermark_after: Option<NaiveDate>,
    pub stats: EventStats,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn retry_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.failed.iter().map(|f| f.date).collect();
        dates.extend(&self.cancelled);
        dates.sort_unstable();
        dates
    }
}

struct DayTask {
    spec: Arc<DatasetSpec>,
    sub_key: Option<String>,
    force_full: bool,
    store: Arc<PartitionedStore>,
    tracker: Arc<WatermarkTracker>,
    source: Arc<dyn RawSource>,
}

/// Calendar filter, scheduler, partition store and watermark tracker wired
/// together for incremental runs.
pub struct IngestionPipeline {
    registry: DatasetRegistry,
    store: Arc<PartitionedStore>,
    tracker: Arc<WatermarkTracker>,
    holidays: Arc<dyn HolidaySource>,
    source: Arc<dyn RawSource>,
    market: String,
    scheduler: AdaptiveScheduler,
}

impl IngestionPipeline {
    pub fn new(
        config: &EngineConfig,
        mut registry: DatasetRegistry,
        holidays: Arc<dyn HolidaySource>,
        source: Arc<dyn RawSource>,
        snapshot: ResourceSnapshot,
    ) -> Result<Self> {
        registry
            .apply_overrides(&config.datasets)
            .map_err(PipelineError::InvalidPolicy)?;
        let policy = SchedulerPolicy::from(&config.scheduler);
        Ok(Self {
            registry,
            store: Arc::new(PartitionedStore::new(&config.data_root)),
            tracker: Arc::new(WatermarkTracker::new(&config.metadata_root)),
            holidays,
            source,
            market: config.market.clone(),
            scheduler: AdaptiveScheduler::new(&policy, &snapshot),
        })
    }

    /// Built-in datasets and a resource snapshot of the current host.
    pub fn from_config(
        config: &EngineConfig,
        holidays: Arc<dyn HolidaySource>,
        source: Arc<dyn RawSource>,
    ) -> Result<Self> {
        Self::new(
            config,
            DatasetRegistry::with_builtin(),
            holidays,
            source,
            ResourceSnapshot::detect(),
        )
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<PartitionedStore> {
        self.store.clone()
    }

    pub fn tracker(&self) -> Arc<WatermarkTracker> {
        self.tracker.clone()
    }

    pub async fn run(&self, request: &RunRequest) -> Result<RunSummary> {
        self.run_with_cancel(request, &CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), stopping dispatch once `cancel` fires. Dates
    /// already running complete and are recorded; the token affects this run
    /// only.
    pub async fn run_with_cancel(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        let spec = self
            .registry
            .get(&request.dataset)
            .ok_or_else(|| PipelineError::UnknownDataset(request.dataset.clone()))?;
        let dates = trading_days(
            &self.market,
            request.start,
            request.end,
            self.holidays.as_ref(),
        )?;
        let sub_key = request.sub_key.as_deref();
        let watermark_before = self.tracker.get_watermark(&spec.name, sub_key)?;

        let mut summary = RunSummary {
            dataset: spec.name.clone(),
            sub_key: request.sub_key.clone(),
            mode: self.scheduler.mode(),
            workers: self.scheduler.workers(),
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
            watermark_before,
            watermark_after: watermark_before,
            stats: EventStats::default(),
        };

        let mut work = dates;
        if !request.force_full && spec.skip_policy == SkipPolicy::Watermark {
            if let Some(mark) = watermark_before {
                let (done, pending): (Vec<_>, Vec<_>) = work.into_iter().partition(|d| *d <= mark);
                summary.skipped.extend(done);
                work = pending;
            }
        }
        info!(
            "run {}{}: {} date(s) to dispatch, {} at or before watermark {:?}",
            spec.name,
            sub_key.map(|s| format!("/{s}")).unwrap_or_default(),
            work.len(),
            summary.skipped.len(),
            watermark_before
        );

        let task = Arc::new(DayTask {
            spec: spec.clone(),
            sub_key: request.sub_key.clone(),
            force_full: request.force_full,
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            source: self.source.clone(),
        });
        let report = self
            .scheduler
            .schedule(work, cancel, move |date| {
                let task = Arc::clone(&task);
                async move { task.process(date).await }
            })
            .await;

        // Advance only through the leading run of completed dates so a
        // failed date is never covered by the watermark.
        let mut advance_to = None;
        let mut contiguous = true;
        for result in &report.results {
            summary.stats.accumulate(&result.outcome.stats);
            match result.outcome.status {
                WorkStatus::Success => summary.succeeded.push(result.item),
                WorkStatus::Skipped => summary.skipped.push(result.item),
                WorkStatus::Failed => {
                    contiguous = false;
                    summary.failed.push(DateFailure {
                        date: result.item,
                        error: result.outcome.error.clone().unwrap_or_default(),
                    });
                }
            }
            if contiguous {
                advance_to = Some(result.item);
            }
        }
        summary.skipped.sort_unstable();
        summary.cancelled = report.cancelled;

        if let Some(date) = advance_to {
            self.tracker.set_watermark(&spec.name, sub_key, date, false)?;
        }
        summary.watermark_after = self.tracker.get_watermark(&spec.name, sub_key)?;

        if summary.is_complete() {
            info!(
                "run {} complete: {} succeeded, {} skipped, watermark {:?}",
                spec.name,
                summary.succeeded.len(),
                summary.skipped.len(),
                summary.watermark_after
            );
        } else {
            warn!(
                "run {} partial: {} succeeded, {} skipped, {} failed, {} cancelled, watermark {:?}",
                spec.name,
                summary.succeeded.len(),
                summary.skipped.len(),
                summary.failed.len(),
                summary.cancelled.len(),
                summary.watermark_after
            );
        }
        Ok(summary)
    }
}

impl DayTask {
    async fn process(self: Arc<Self>, date: NaiveDate) -> WorkOutcome<EventStats> {
        if !self.force_full && self.spec.skip_policy == SkipPolicy::Existence {
            let task = Arc::clone(&self);
            let existing = tokio::task::spawn_blocking(move || {
                task.store
                    .has_partitions_for_date(&task.spec, date, task.sub_key.as_deref())
            })
            .await;
            match existing {
                Ok(Ok(true)) => return self.finish_skipped(date).await,
                Ok(Ok(false)) => {}
                Ok(Err(err)) => return self.finish_failed(date, err.to_string()).await,
                Err(err) => return self.finish_failed(date, err.to_string()).await,
            }
        }

        let fetched = self
            .source
            .fetch(&self.spec, date, self.sub_key.as_deref())
            .await;
        let batch = match fetched {
            Ok(batch) => batch,
            Err(err) => return self.finish_failed(date, format!("fetch failed: {err}")).await,
        };

        let task = Arc::clone(&self);
        let stored = tokio::task::spawn_blocking(move || task.store_day(date, &batch)).await;
        match stored {
            Ok(Ok(stats)) => WorkOutcome::success(stats),
            Ok(Err(err)) => self.finish_failed(date, err.to_string()).await,
            Err(err) => self.finish_failed(date, err.to_string()).await,
        }
    }

    /// Conforms, merges and records one fetched day. Runs on the blocking
    /// pool.
    fn store_day(&self, date: NaiveDate, batch: &RecordBatch) -> Result<EventStats> {
        let sub_key = self.sub_key.as_deref();
        let mut stats = EventStats::default();
        if batch.num_rows() == 0 {
            warn!("{} {}: source returned no rows", self.spec.name, date);
        } else {
            let conformed = self
                .spec
                .conform(batch)
                .map_err(|source| StoreError::SchemaMismatch {
                    dataset: self.spec.name.clone(),
                    source,
                })?;
            check_row_dates(&self.spec, &conformed, date)?;
            if let Some(sub_key) = sub_key {
                check_row_symbols(&self.spec, &conformed, date, sub_key)?;
            }
            for (key, rows) in split_by_partition(&self.spec, &conformed)? {
                let written = self.store.merge(&self.spec, &key, &rows)?;
                stats.records += written.rows_in as u64;
                stats.bytes += written.bytes;
                stats.partitions += 1;
                stats.duplicates_dropped += written.duplicates_dropped as u64;
            }
        }
        self.tracker
            .record_event(&self.spec.name, date, sub_key, IngestStatus::Success, stats, None)?;
        Ok(stats)
    }

    async fn finish_skipped(self: Arc<Self>, date: NaiveDate) -> WorkOutcome<EventStats> {
        let task = Arc::clone(&self);
        let recorded = tokio::task::spawn_blocking(move || {
            let sub_key = task.sub_key.as_deref();
            // A key already recorded as complete keeps its event untouched.
            match task.tracker.get_event(&task.spec.name, date, sub_key) {
                Some(EventEntry::Event(e)) if e.status.is_terminal_success() => Ok(()),
                _ => task
                    .tracker
                    .record_event(
                        &task.spec.name,
                        date,
                        sub_key,
                        IngestStatus::Skipped,
                        EventStats::default(),
                        None,
                    )
                    .map(|_| ()),
            }
        })
        .await;
        match recorded {
            Ok(Ok(())) => WorkOutcome::skipped(EventStats::default()),
            Ok(Err(err)) => WorkOutcome::failed(err.to_string()),
            Err(err) => WorkOutcome::failed(err.to_string()),
        }
    }

    async fn finish_failed(self: Arc<Self>, date: NaiveDate, message: String) -> WorkOutcome<EventStats> {
        error!("{} {} failed: {}", self.spec.name, date, message);
        let task = Arc::clone(&self);
        let event_error = message.clone();
        let recorded = tokio::task::spawn_blocking(move || {
            task.tracker.record_event(
                &task.spec.name,
                date,
                task.sub_key.as_deref(),
                IngestStatus::Failed,
                EventStats::default(),
                Some(event_error),
            )
        })
        .await;
        match recorded {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!("could not record failure for {} {}: {}", self.spec.name, date, err),
            Err(err) => error!("could not record failure for {} {}: {}", self.spec.name, date, err),
        }
        WorkOutcome::failed(message)
    }
}

/// Rows handed back for `date` must all carry that date.
fn check_row_dates(spec: &DatasetSpec, batch: &RecordBatch, date: NaiveDate) -> Result<()> {
    let expected = date_to_days(date);
    let stray = batch
        .column_by_name(&spec.date_column)
        .and_then(|c| c.as_any().downcast_ref::<Date32Array>())
        .and_then(|dates| dates.iter().flatten().find(|d| *d != expected));
    match stray {
        None => Ok(()),
        Some(days) => Err(PipelineError::StrayRows {
            date,
            found: days_to_date(days)
                .map(|d| d.to_string())
                .unwrap_or_else(|| format!("day {days}")),
        }),
    }
}

/// With a sub-key on a symbol-partitioned dataset, every row must belong to
/// that symbol; its event covers nothing else.
fn check_row_symbols(
    spec: &DatasetSpec,
    batch: &RecordBatch,
    date: NaiveDate,
    sub_key: &str,
) -> Result<()> {
    if !spec.partition_scheme.requires_symbol() {
        return Ok(());
    }
    let Some(column) = spec.symbol_column.as_deref() else {
        return Ok(());
    };
    let stray = batch
        .column_by_name(column)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .and_then(|symbols| symbols.iter().flatten().find(|s| *s != sub_key));
    match stray {
        None => Ok(()),
        Some(found) => Err(PipelineError::StraySymbol {
            date,
            sub_key: sub_key.to_string(),
            found: found.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::ArrayRef;
    use async_trait::async_trait;
    use chrono::Datelike;
    use core_types::{config::SchedulerConfig, DailyBar, MinuteBar, StaticHolidays};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::error::BoxError;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[derive(Default)]
    struct FakeSource {
        failing: Mutex<HashSet<NaiveDate>>,
        mislabelled: Mutex<HashSet<NaiveDate>>,
        extra_symbol: Mutex<Option<String>>,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn daily(date: NaiveDate) -> RecordBatch {
            let rows: Vec<DailyBar> = ["AAPL", "MSFT"]
                .iter()
                .map(|symbol| DailyBar {
                    symbol: symbol.to_string(),
                    date,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0 + f64::from(date.day()),
                    volume: 1_000,
                    vwap: Some(100.5),
                    transactions: Some(42),
                })
                .collect();
            DailyBar::to_record_batch(&rows).unwrap()
        }

        fn minute(date: NaiveDate, symbol: &str) -> RecordBatch {
            let rows: Vec<MinuteBar> = (0..3)
                .map(|i| MinuteBar {
                    symbol: symbol.to_string(),
                    ts_ns: i64::from(date_to_days(date)) * 86_400_000_000_000 + i * 60_000_000_000,
                    date,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0 + i as f64,
                    volume: 5,
                    transactions: Some(1),
                })
                .collect();
            MinuteBar::to_record_batch(&rows).unwrap()
        }
    }

    #[async_trait]
    impl RawSource for FakeSource {
        async fn fetch(
            &self,
            dataset: &DatasetSpec,
            date: NaiveDate,
            sub_key: Option<&str>,
        ) -> std::result::Result<RecordBatch, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Later dates finish first so completion order differs from date order.
            let lag = 40u64.saturating_sub(u64::from(date_to_days(date).unsigned_abs() % 10) * 8);
            tokio::time::sleep(Duration::from_millis(lag)).await;
            if self.failing.lock().contains(&date) {
                return Err(format!("upstream error for {date}").into());
            }
            if dataset.name == MinuteBar::spec().name {
                let rows = Self::minute(date, sub_key.unwrap_or("SPY"));
                let extra = self.extra_symbol.lock().clone();
                return Ok(match extra {
                    Some(symbol) => {
                        let other = Self::minute(date, &symbol);
                        arrow::compute::concat_batches(&rows.schema(), &[rows, other]).unwrap()
                    }
                    None => rows,
                });
            }
            if self.mislabelled.lock().contains(&date) {
                let batch = Self::daily(date);
                let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
                columns.pop();
                let schema = Arc::new(batch.schema().project(&(0..columns.len()).collect::<Vec<_>>()).unwrap());
                return Ok(RecordBatch::try_new(schema, columns).unwrap());
            }
            Ok(Self::daily(date))
        }
    }

    struct Harness {
        _dir: TempDir,
        config: EngineConfig,
        source: Arc<FakeSource>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = EngineConfig {
                data_root: dir.path().join("lake"),
                metadata_root: dir.path().join("metadata"),
                feature_root: dir.path().join("binary"),
                scheduler: SchedulerConfig {
                    mode: Some(ProcessingMode::Parallel),
                    max_workers: 3,
                    ..SchedulerConfig::default()
                },
                ..EngineConfig::default()
            };
            Self {
                _dir: dir,
                config,
                source: Arc::new(FakeSource::default()),
            }
        }

        fn pipeline(&self) -> IngestionPipeline {
            let holidays = StaticHolidays::new().with_market("NYSE", d(1), d(31), []);
            IngestionPipeline::new(
                &self.config,
                DatasetRegistry::with_builtin(),
                Arc::new(holidays),
                self.source.clone(),
                ResourceSnapshot::from_gb(128.0, 8),
            )
            .unwrap()
        }
    }

    fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let key = path.strip_prefix(root).unwrap().display().to_string();
                    files.insert(key, std::fs::read(&path).unwrap());
                }
            }
        }
        files
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn watermark_stops_before_first_failed_date() {
        let harness = Harness::new();
        harness.source.failing.lock().insert(d(3));
        let pipeline = harness.pipeline();
        assert_eq!(pipeline.scheduler.workers(), 3);

        let summary = pipeline
            .run(&RunRequest::new("stocks_daily", d(1), d(5)))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, vec![d(1), d(2), d(4), d(5)]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].date, d(3));
        assert!(summary.failed[0].error.contains("upstream error"));
        assert_eq!(summary.watermark_after, Some(d(2)));
        assert_eq!(summary.retry_dates(), vec![d(3)]);

        let tracker = pipeline.tracker();
        let failed = tracker.get_event("stocks_daily", d(3), None).unwrap().into_event().unwrap();
        assert_eq!(failed.status, IngestStatus::Failed);
        assert_eq!(
            tracker.missing_dates("stocks_daily", None, &[d(1), d(2), d(3), d(4), d(5)]),
            vec![d(3)]
        );

        harness.source.failing.lock().clear();
        let retry = pipeline
            .run(&RunRequest::new("stocks_daily", d(1), d(5)))
            .await
            .unwrap();
        assert_eq!(retry.skipped, vec![d(1), d(2)]);
        assert_eq!(retry.succeeded, vec![d(3), d(4), d(5)]);
        assert_eq!(retry.watermark_after, Some(d(5)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn second_run_is_a_no_op() {
        let harness = Harness::new();
        let pipeline = harness.pipeline();
        let request = RunRequest::new("stocks_daily", d(1), d(5));
        let first = pipeline.run(&request).await.unwrap();
        assert!(first.is_complete());
        assert_eq!(first.succeeded.len(), 5);
        assert_eq!(first.stats.records, 10);

        let lake = snapshot_tree(&harness.config.data_root);
        let meta = snapshot_tree(&harness.config.metadata_root);
        let calls = harness.source.calls.load(Ordering::SeqCst);

        let second = pipeline.run(&request).await.unwrap();
        assert!(second.succeeded.is_empty());
        assert_eq!(second.skipped, vec![d(1), d(2), d(3), d(4), d(5)]);
        assert_eq!(second.watermark_after, first.watermark_after);
        assert_eq!(harness.source.calls.load(Ordering::SeqCst), calls);
        assert_eq!(snapshot_tree(&harness.config.data_root), lake);
        assert_eq!(snapshot_tree(&harness.config.metadata_root), meta);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn existence_policy_skips_written_partitions() {
        let harness = Harness::new();
        let pipeline = harness.pipeline();
        let request = RunRequest::new("stocks_minute", d(1), d(3)).with_sub_key("SPY");
        let first = pipeline.run(&request).await.unwrap();
        assert_eq!(first.succeeded, vec![d(1), d(2), d(3)]);
        assert_eq!(first.watermark_after, Some(d(3)));
        assert!(harness
            .config
            .data_root
            .join("stocks_minute/year=2024/month=01/day=02/symbol=SPY/data.parquet")
            .is_file());

        let meta = snapshot_tree(&harness.config.metadata_root);
        let calls = harness.source.calls.load(Ordering::SeqCst);
        let second = pipeline.run(&request).await.unwrap();
        assert_eq!(second.skipped, vec![d(1), d(2), d(3)]);
        assert_eq!(harness.source.calls.load(Ordering::SeqCst), calls);
        assert_eq!(snapshot_tree(&harness.config.metadata_root), meta);

        let forced = pipeline.run(&request.clone().force_full()).await.unwrap();
        assert_eq!(forced.succeeded, vec![d(1), d(2), d(3)]);
        let rows = pipeline
            .store()
            .read(&MinuteBar::spec(), &core_types::PartitionKey::day_symbol(d(2), "SPY"))
            .unwrap();
        assert_eq!(rows.num_rows(), 3);
    }

    #[tokio::test]
    async fn sub_key_run_rejects_other_symbols() {
        let harness = Harness::new();
        *harness.source.extra_symbol.lock() = Some("QQQ".to_string());
        let pipeline = harness.pipeline();
        let summary = pipeline
            .run(&RunRequest::new("stocks_minute", d(2), d(2)).with_sub_key("SPY"))
            .await
            .unwrap();
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].error.contains("QQQ"));
        assert_eq!(summary.watermark_after, None);
        let spec = MinuteBar::spec();
        assert!(pipeline.store().list_partitions(&spec).unwrap().is_empty());
        let event = pipeline
            .tracker()
            .get_event("stocks_minute", d(2), Some("SPY"))
            .unwrap()
            .into_event()
            .unwrap();
        assert_eq!(event.status, IngestStatus::Failed);
    }

    #[tokio::test]
    async fn schema_drift_fails_only_that_date() {
        let harness = Harness::new();
        harness.source.mislabelled.lock().insert(d(2));
        let pipeline = harness.pipeline();
        let summary = pipeline
            .run(&RunRequest::new("stocks_daily", d(1), d(3)))
            .await
            .unwrap();
        assert_eq!(summary.succeeded, vec![d(1), d(3)]);
        assert_eq!(summary.failed[0].date, d(2));
        assert!(summary.failed[0].error.contains("schema mismatch"));
        assert_eq!(summary.watermark_after, Some(d(1)));
    }

    #[tokio::test]
    async fn configuration_errors_abort_before_dispatch() {
        let harness = Harness::new();
        let pipeline = harness.pipeline();
        let err = pipeline
            .run(&RunRequest::new("stocks_weekly", d(1), d(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownDataset(_)));

        let out_of_range = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let err = pipeline
            .run(&RunRequest::new("stocks_daily", d(30), out_of_range))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Calendar(_)));
        assert_eq!(harness.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_override_is_rejected_at_construction() {
        let mut harness = Harness::new();
        harness.config.datasets.insert(
            "stocks_daily".to_string(),
            core_types::config::DatasetOverrides {
                conflict_policy: None,
                skip_policy: Some(SkipPolicy::Existence),
            },
        );
        let holidays = StaticHolidays::new().with_market("NYSE", d(1), d(31), []);
        let result = IngestionPipeline::new(
            &harness.config,
            DatasetRegistry::with_builtin(),
            Arc::new(holidays),
            harness.source.clone(),
            ResourceSnapshot::from_gb(8.0, 2),
        );
        assert!(matches!(result, Err(PipelineError::InvalidPolicy(_))));
    }

    #[tokio::test]
    async fn cancelled_run_leaves_watermark_alone() {
        let harness = Harness::new();
        let pipeline = harness.pipeline();
        let request = RunRequest::new("stocks_daily", d(1), d(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = pipeline.run_with_cancel(&request, &cancel).await.unwrap();
        assert_eq!(summary.cancelled, vec![d(1), d(2), d(3), d(4), d(5)]);
        assert_eq!(summary.watermark_after, None);
        assert!(!summary.is_complete());

        let next = pipeline.run(&request).await.unwrap();
        assert!(next.is_complete());
        assert_eq!(next.succeeded, vec![d(1), d(2), d(3), d(4), d(5)]);
        assert_eq!(next.watermark_after, Some(d(5)));
    }
}
