//! Statistics records produced once per reporting interval

use crate::types::events::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// GPU stats for a single process over one interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// Normalized share of the device's thread capacity used in the interval (0.0 to 1.0)
    pub utilization_percentage: f64,

    /// Bytes still allocated at the end of the interval
    pub current_memory_bytes: u64,

    /// Peak concurrently allocated bytes observed during the interval
    pub max_memory_bytes: u64,
}

/// Stats for every process reported in an interval
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuStats {
    pub pid_stats: HashMap<Pid, ProcessStats>,
}

impl GpuStats {
    pub fn is_empty(&self) -> bool {
        self.pid_stats.is_empty()
    }

    /// Sum of the reported utilizations across processes
    pub fn total_utilization(&self) -> f64 {
        self.pid_stats
            .values()
            .map(|s| s.utilization_percentage)
            .sum()
    }
}
