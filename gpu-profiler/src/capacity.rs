//! Device capacity and time sources consumed by the accounting core

use crate::error::Result;
use gpuscope_shared::types::events::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// Read-only description of device capacity
pub trait DeviceCapacity: Send + Sync {
    /// Maximum number of threads the device can run concurrently
    fn max_threads(&self, device_index: usize) -> Option<u64>;

    /// Number of devices described
    fn device_count(&self) -> usize;
}

/// Static device capacities, indexed by device number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemContext {
    max_gpu_threads_per_device: Vec<u64>,
}

impl SystemContext {
    pub fn new(max_gpu_threads_per_device: Vec<u64>) -> Self {
        Self {
            max_gpu_threads_per_device,
        }
    }
}

impl DeviceCapacity for SystemContext {
    fn max_threads(&self, device_index: usize) -> Option<u64> {
        self.max_gpu_threads_per_device.get(device_index).copied()
    }

    fn device_count(&self) -> usize {
        self.max_gpu_threads_per_device.len()
    }
}

/// Source of "now" in the same time base as event timestamps
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> Result<Timestamp>;
}

/// `CLOCK_MONOTONIC`, matching `bpf_ktime_get_ns()`
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> Result<Timestamp> {
        Ok(gpuscope_shared::utils::time::monotonic_nanos()?)
    }
}

/// Clock driven by the caller, for replays and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::Relaxed);
    }

    /// Move the clock forward, never backwards
    pub fn advance_to(&self, now: Timestamp) {
        self.now.fetch_max(now, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> Result<Timestamp> {
        Ok(self.now.load(Ordering::Relaxed))
    }
}
