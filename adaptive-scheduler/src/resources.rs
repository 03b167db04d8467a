// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::fs;

use log::warn;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MEMINFO: &str = "/proc/meminfo";

/// Point-in-time view of the host, taken once per run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    pub available_memory_bytes: u64,
    pub cores: usize,
}

impl ResourceSnapshot {
    pub fn new(available_memory_bytes: u64, cores: usize) -> Self {
        Self {
            available_memory_bytes,
            cores: cores.max(1),
        }
    }

    pub fn from_gb(available_gb: f64, cores: usize) -> Self {
        Self::new((available_gb.max(0.0) * GIB) as u64, cores)
    }

    /// Reads available memory from `/proc/meminfo` and the logical core
    /// count. Unknown memory is reported as zero.
    pub fn detect() -> Self {
        let memory = fs::read_to_string(MEMINFO)
            .ok()
            .and_then(|text| parse_meminfo(&text));
        if memory.is_none() {
            warn!("available memory unknown ({} unreadable); assuming none", MEMINFO);
        }
        Self::new(memory.unwrap_or(0), num_cpus::get())
    }

    pub fn available_gb(&self) -> f64 {
        self.available_memory_bytes as f64 / GIB
    }
}

fn meminfo_field(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .and_then(|kib| kib.checked_mul(1024))
}

/// `MemAvailable` when the kernel reports it, otherwise `MemTotal`.
pub(crate) fn parse_meminfo(text: &str) -> Option<u64> {
    meminfo_field(text, "MemAvailable:").or_else(|| meminfo_field(text, "MemTotal:"))
}
