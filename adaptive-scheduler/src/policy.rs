// Copyright (c) James Kassemi, SC, US. All rights reserved.

use core_types::{config::SchedulerConfig, ProcessingMode};

use crate::resources::ResourceSnapshot;

/// Thresholds that map a resource snapshot to a processing mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerPolicy {
    pub mode_override: Option<ProcessingMode>,
    pub streaming_below_gb: f64,
    pub parallel_above_gb: f64,
    pub per_task_gb: f64,
    /// 0 leaves the worker count bounded by cores only.
    pub max_workers: usize,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerPolicy {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            mode_override: cfg.mode,
            streaming_below_gb: cfg.streaming_below_gb,
            parallel_above_gb: cfg.parallel_above_gb,
            per_task_gb: cfg.per_task_gb,
            max_workers: cfg.max_workers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode: ProcessingMode,
    pub workers: usize,
}

fn cap_workers(workers: usize, max_workers: usize) -> usize {
    match max_workers {
        0 => workers.max(1),
        n => workers.clamp(1, n),
    }
}

/// Picks the mode for one run. A configured override wins over the
/// thresholds; the worker count always follows the chosen mode.
pub fn select_mode(policy: &SchedulerPolicy, snapshot: &ResourceSnapshot) -> ModeDecision {
    let available = snapshot.available_gb();
    let mode = policy.mode_override.unwrap_or(if available < policy.streaming_below_gb {
        ProcessingMode::Streaming
    } else if available >= policy.parallel_above_gb {
        ProcessingMode::Parallel
    } else {
        ProcessingMode::Batch
    });
    let workers = match mode {
        ProcessingMode::Streaming => 1,
        ProcessingMode::Parallel => cap_workers(snapshot.cores, policy.max_workers),
        ProcessingMode::Batch => {
            let by_memory = if policy.per_task_gb > 0.0 {
                (available / policy.per_task_gb).floor() as usize
            } else {
                snapshot.cores
            };
            cap_workers(snapshot.cores.min(by_memory), policy.max_workers)
        }
    };
    ModeDecision { mode, workers }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_memory_streams() {
        let decision = select_mode(&SchedulerPolicy::default(), &ResourceSnapshot::from_gb(16.0, 8));
        assert_eq!(decision, ModeDecision { mode: ProcessingMode::Streaming, workers: 1 });
    }

    #[test]
    fn mid_memory_batches_by_per_task_estimate() {
        let policy = SchedulerPolicy::default();
        let decision = select_mode(&policy, &ResourceSnapshot::from_gb(40.0, 16));
        assert_eq!(decision, ModeDecision { mode: ProcessingMode::Batch, workers: 10 });
        let decision = select_mode(&policy, &ResourceSnapshot::from_gb(48.0, 4));
        assert_eq!(decision, ModeDecision { mode: ProcessingMode::Batch, workers: 4 });
    }

    #[test]
    fn abundant_memory_uses_every_core() {
        let decision = select_mode(&SchedulerPolicy::default(), &ResourceSnapshot::from_gb(128.0, 12));
        assert_eq!(decision, ModeDecision { mode: ProcessingMode::Parallel, workers: 12 });
    }

    #[test]
    fn max_workers_caps_parallel_and_batch() {
        let policy = SchedulerPolicy {
            max_workers: 3,
            ..SchedulerPolicy::default()
        };
        assert_eq!(select_mode(&policy, &ResourceSnapshot::from_gb(128.0, 12)).workers, 3);
        assert_eq!(select_mode(&policy, &ResourceSnapshot::from_gb(40.0, 12)).workers, 3);
    }

    #[test]
    fn override_wins_over_thresholds() {
        let policy = SchedulerPolicy {
            mode_override: Some(ProcessingMode::Streaming),
            ..SchedulerPolicy::default()
        };
        let decision = select_mode(&policy, &ResourceSnapshot::from_gb(256.0, 32));
        assert_eq!(decision, ModeDecision { mode: ProcessingMode::Streaming, workers: 1 });

        let policy = SchedulerPolicy {
            mode_override: Some(ProcessingMode::Parallel),
            ..SchedulerPolicy::default()
        };
        assert_eq!(select_mode(&policy, &ResourceSnapshot::from_gb(1.0, 6)).workers, 6);
    }
}
