// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{fmt::Debug, future::Future, sync::Arc};

use core_types::ProcessingMode;
use futures::future::join_all;
use log::{error, info, warn};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    policy::{select_mode, ModeDecision, SchedulerPolicy},
    resources::ResourceSnapshot,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Success,
    Skipped,
    Failed,
}

/// What a worker reports for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkOutcome<S> {
    pub status: WorkStatus,
    pub stats: S,
    pub error: Option<String>,
}

impl<S: Default> WorkOutcome<S> {
    pub fn success(stats: S) -> Self {
        Self {
            status: WorkStatus::Success,
            stats,
            error: None,
        }
    }

    pub fn skipped(stats: S) -> Self {
        Self {
            status: WorkStatus::Skipped,
            stats,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: WorkStatus::Failed,
            stats: S::default(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemResult<T, S> {
    pub item: T,
    pub outcome: WorkOutcome<S>,
}

/// Results in dispatch order, plus items never dispatched because the run
/// was cancelled.
#[derive(Debug, Clone)]
pub struct ScheduleReport<T, S> {
    pub results: Vec<ItemResult<T, S>>,
    pub cancelled: Vec<T>,
}

impl<T, S> ScheduleReport<T, S> {
    pub fn failed(&self) -> impl Iterator<Item = &ItemResult<T, S>> {
        self.results
            .iter()
            .filter(|r| r.outcome.status == WorkStatus::Failed)
    }

    pub fn is_complete(&self) -> bool {
        self.cancelled.is_empty() && self.failed().next().is_none()
    }
}

/// Bounded worker pool whose width is fixed at construction from the
/// policy and resource snapshot.
pub struct AdaptiveScheduler {
    decision: ModeDecision,
}

impl AdaptiveScheduler {
    pub fn new(policy: &SchedulerPolicy, snapshot: &ResourceSnapshot) -> Self {
        let decision = select_mode(policy, snapshot);
        info!(
            "scheduler mode {:?} with {} worker(s) ({:.1} GiB available, {} cores)",
            decision.mode,
            decision.workers,
            snapshot.available_gb(),
            snapshot.cores
        );
        Self { decision }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.decision.mode
    }

    pub fn workers(&self) -> usize {
        self.decision.workers
    }

    /// Runs `worker` over `items` with at most [`workers`](Self::workers)
    /// in flight. A failing or panicking item is reported as failed without
    /// affecting the others.
    ///
    /// `cancel` belongs to this call: once cancelled, no further item is
    /// dispatched, items already running finish and are reported, and the
    /// rest come back in [`ScheduleReport::cancelled`].
    pub async fn schedule<T, S, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        worker: F,
    ) -> ScheduleReport<T, S>
    where
        T: Clone + Debug + Send + 'static,
        S: Default + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkOutcome<S>> + Send + 'static,
    {
        let pool = Arc::new(Semaphore::new(self.decision.workers));
        let worker = Arc::new(worker);
        let mut dispatched = Vec::with_capacity(items.len());
        let mut handles = Vec::with_capacity(items.len());
        let mut cancelled = Vec::new();

        let mut pending = items.into_iter();
        while let Some(item) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = pool.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                cancelled.push(item);
                cancelled.extend(pending.by_ref());
                warn!("run cancelled; {} item(s) not dispatched", cancelled.len());
                break;
            };
            let worker = Arc::clone(&worker);
            let task_item = item.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                worker(task_item).await
            }));
            dispatched.push(item);
        }

        let results = dispatched
            .into_iter()
            .zip(join_all(handles).await)
            .map(|(item, joined)| {
                let outcome = joined.unwrap_or_else(|err| {
                    error!("worker for {:?} aborted: {}", item, err);
                    WorkOutcome::failed(format!("worker aborted: {err}"))
                });
                ItemResult { item, outcome }
            })
            .collect();
        ScheduleReport { results, cancelled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn scheduler(workers: usize) -> AdaptiveScheduler {
        let policy = SchedulerPolicy {
            mode_override: Some(ProcessingMode::Parallel),
            max_workers: workers,
            ..SchedulerPolicy::default()
        };
        AdaptiveScheduler::new(&policy, &ResourceSnapshot::from_gb(128.0, 64))
    }

    #[tokio::test]
    async fn bounds_concurrency_and_keeps_order() {
        let scheduler = scheduler(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let report = scheduler
            .schedule((0..10u32).collect(), &CancellationToken::new(), move |i| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5 + (10 - i as u64))).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    WorkOutcome::success(i)
                }
            })
            .await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let items: Vec<u32> = report.results.iter().map(|r| r.item).collect();
        assert_eq!(items, (0..10).collect::<Vec<_>>());
        assert!(report.results.iter().all(|r| r.outcome.stats == r.item));
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn failures_and_panics_are_isolated() {
        let scheduler = scheduler(2);
        let report = scheduler
            .schedule(vec![1u32, 2, 3, 4], &CancellationToken::new(), |i| async move {
                match i {
                    2 => WorkOutcome::<u64>::failed("upstream 503"),
                    3 => panic!("worker bug"),
                    _ => WorkOutcome::success(i as u64),
                }
            })
            .await;
        let statuses: Vec<WorkStatus> = report.results.iter().map(|r| r.outcome.status).collect();
        assert_eq!(
            statuses,
            vec![WorkStatus::Success, WorkStatus::Failed, WorkStatus::Failed, WorkStatus::Success]
        );
        assert_eq!(report.results[1].outcome.error.as_deref(), Some("upstream 503"));
        assert!(report.results[2].outcome.error.as_deref().unwrap().contains("aborted"));
        assert_eq!(report.failed().count(), 2);
    }

    #[tokio::test]
    async fn streaming_runs_items_one_at_a_time() {
        let policy = SchedulerPolicy::default();
        let scheduler = AdaptiveScheduler::new(&policy, &ResourceSnapshot::from_gb(8.0, 16));
        assert_eq!(scheduler.mode(), ProcessingMode::Streaming);
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let l = log.clone();
        scheduler
            .schedule(vec![1u32, 2, 3], &CancellationToken::new(), move |i| {
                let log = l.clone();
                async move {
                    log.lock().push(format!("start {i}"));
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    log.lock().push(format!("end {i}"));
                    WorkOutcome::<()>::success(())
                }
            })
            .await;
        assert_eq!(
            *log.lock(),
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_but_finishes_in_flight() {
        let policy = SchedulerPolicy::default();
        let scheduler = AdaptiveScheduler::new(&policy, &ResourceSnapshot::from_gb(8.0, 4));
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let report = scheduler
            .schedule(vec![1u32, 2, 3], &token, move |i| {
                let token = worker_token.clone();
                async move {
                    token.cancel();
                    WorkOutcome::success(i)
                }
            })
            .await;
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].outcome.status, WorkStatus::Success);
        assert_eq!(report.cancelled, vec![2, 3]);
        assert!(!report.is_complete());

        let next = scheduler
            .schedule(vec![10u32, 11], &CancellationToken::new(), |i| async move {
                WorkOutcome::success(i)
            })
            .await;
        assert!(next.cancelled.is_empty());
        assert_eq!(next.results.len(), 2);
        assert!(next.is_complete());
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let scheduler = scheduler(4);
        let token = CancellationToken::new();
        token.cancel();
        let report = scheduler
            .schedule(vec!['a', 'b'], &token, |_| async { WorkOutcome::<()>::success(()) })
            .await;
        assert!(report.results.is_empty());
        assert_eq!(report.cancelled, vec!['a', 'b']);
    }
}
