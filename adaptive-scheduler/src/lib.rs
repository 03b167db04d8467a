// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Memory-aware choice of concurrency level and a bounded worker pool that
//! runs one work item per slot.

mod policy;
mod resources;
mod scheduler;

pub use policy::{select_mode, ModeDecision, SchedulerPolicy};
pub use resources::ResourceSnapshot;
pub use scheduler::{AdaptiveScheduler, ItemResult, ScheduleReport, WorkOutcome, WorkStatus};
pub use tokio_util::sync::CancellationToken;
