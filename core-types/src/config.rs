// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::collections::HashMap;
use std::path::PathBuf;

pub use config::ConfigError;

use config::Config;
use serde::{Deserialize, Serialize};

use crate::schema::{ConflictPolicy, SkipPolicy};

/// Engine configuration: storage roots, scheduler policy, dataset overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_metadata_root")]
    pub metadata_root: PathBuf,
    #[serde(default = "default_feature_root")]
    pub feature_root: PathBuf,
    #[serde(default = "default_market")]
    pub market: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub datasets: HashMap<String, DatasetOverrides>,
    #[serde(default)]
    pub conversion: ConversionConfig,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data/lake")
}

fn default_metadata_root() -> PathBuf {
    PathBuf::from("data/metadata")
}

fn default_feature_root() -> PathBuf {
    PathBuf::from("data/binary")
}

fn default_market() -> String {
    "NYSE".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            metadata_root: default_metadata_root(),
            feature_root: default_feature_root(),
            market: default_market(),
            scheduler: SchedulerConfig::default(),
            datasets: HashMap::new(),
            conversion: ConversionConfig::default(),
        }
    }
}

/// Concurrency level for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    Streaming,
    Batch,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Forces a mode instead of deriving it from the resource snapshot.
    #[serde(default)]
    pub mode: Option<ProcessingMode>,
    #[serde(default = "default_streaming_below_gb")]
    pub streaming_below_gb: f64,
    #[serde(default = "default_parallel_above_gb")]
    pub parallel_above_gb: f64,
    #[serde(default = "default_per_task_gb")]
    pub per_task_gb: f64,
    /// Upper bound on worker slots; 0 means no bound beyond core count.
    #[serde(default)]
    pub max_workers: usize,
}

fn default_streaming_below_gb() -> f64 {
    32.0
}

fn default_parallel_above_gb() -> f64 {
    64.0
}

fn default_per_task_gb() -> f64 {
    4.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: None,
            streaming_below_gb: default_streaming_below_gb(),
            parallel_above_gb: default_parallel_above_gb(),
            per_task_gb: default_per_task_gb(),
            max_workers: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetOverrides {
    #[serde(default)]
    pub conflict_policy: Option<ConflictPolicy>,
    #[serde(default)]
    pub skip_policy: Option<SkipPolicy>,
}

/// Value used for calendar positions without an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    #[default]
    Nan,
    ForwardFill,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default)]
    pub fill_policy: FillPolicy,
}

impl EngineConfig {
    /// Loads `engine.toml` (optional) with `QLAKE_` environment overrides,
    /// e.g. `QLAKE_SCHEDULER__MODE=streaming`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("engine.toml")
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("QLAKE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let sched = &self.scheduler;
        if sched.per_task_gb <= 0.0 {
            return Err(ConfigError::Message(
                "scheduler.per_task_gb must be positive".to_string(),
            ));
        }
        if sched.streaming_below_gb > sched.parallel_above_gb {
            return Err(ConfigError::Message(
                "scheduler.streaming_below_gb exceeds scheduler.parallel_above_gb".to_string(),
            ));
        }
        Ok(())
    }
}
