//! Per-process aggregation of stream data into interval statistics

use crate::capacity::DeviceCapacity;
use crate::error::{GpuError, Result};
use crate::stream::{KernelSpan, MemoryAllocation, StreamSnapshot};
use crate::tseries::TimeSeriesBuilder;
use gpuscope_shared::types::events::Timestamp;
use gpuscope_shared::types::stats::ProcessStats;
use gpuscope_shared::utils::time::nanos_to_secs;
use tracing::debug;

/// Receives stream-level data for one process and aggregates it into metrics
#[derive(Debug)]
pub struct Aggregator {
    /// Thread capacity of the device the process runs on
    max_threads: u64,

    /// Thread-seconds used by the process in the current interval
    total_thread_seconds_used: f64,

    /// Kernel time of the last check; only activity after it counts towards
    /// the current interval
    last_check_ktime: Timestamp,

    /// Kernel time the current measurement ends at
    interval_end_ktime: Timestamp,

    /// Length of the current measurement, in nanoseconds
    measured_interval_ns: i64,

    /// Live allocations, re-observed every interval
    current_allocs: Vec<MemoryAllocation>,

    /// Allocations closed since the last report
    past_allocs: Vec<MemoryAllocation>,

    /// Divisor spreading device utilization over every process sharing it
    utilization_norm_factor: Option<f64>,
}

impl Aggregator {
    /// Create an aggregator for a process running on `device_index`, with
    /// its first interval starting at `start_ktime`.
    pub fn new(
        capacity: &dyn DeviceCapacity,
        device_index: usize,
        start_ktime: Timestamp,
    ) -> Result<Self> {
        let max_threads = capacity
            .max_threads(device_index)
            .ok_or(GpuError::UnknownDevice(device_index))?;
        if max_threads == 0 {
            return Err(GpuError::InvalidCapacity(device_index));
        }

        Ok(Self {
            max_threads,
            total_thread_seconds_used: 0.0,
            last_check_ktime: start_ktime,
            interval_end_ktime: start_ktime,
            measured_interval_ns: 0,
            current_allocs: Vec::new(),
            past_allocs: Vec::new(),
            utilization_norm_factor: None,
        })
    }

    pub fn last_check_ktime(&self) -> Timestamp {
        self.last_check_ktime
    }

    pub fn thread_seconds_used(&self) -> f64 {
        self.total_thread_seconds_used
    }

    /// Start measuring the interval `[last_check, now]`.
    ///
    /// Live allocations from the previous interval are dropped here, since
    /// every stream reports them again through `absorb_current`.
    pub fn begin_interval(&mut self, now: Timestamp) {
        self.interval_end_ktime = now;
        self.measured_interval_ns = now as i64 - self.last_check_ktime as i64;
        self.current_allocs.clear();
    }

    /// Add the thread-seconds a span used after the last check
    fn process_kernel_span(&mut self, span: &KernelSpan) {
        // Only consider time not already accounted for in a previous interval
        let start = span.start_ktime.max(self.last_check_ktime);
        if span.end_ktime <= start {
            return;
        }

        let duration_sec = nanos_to_secs((span.end_ktime - start) as i64);
        // A process can't use more threads than the GPU has
        let threads = span.avg_thread_count.min(self.max_threads);
        self.total_thread_seconds_used += duration_sec * threads as f64;
    }

    /// Take spans and allocations that have already been closed
    pub fn absorb_past(&mut self, data: StreamSnapshot) {
        for span in &data.spans {
            self.process_kernel_span(span);
        }
        self.past_allocs.extend(data.allocations);
    }

    /// Take spans and allocations that are still active
    pub fn absorb_current(&mut self, data: StreamSnapshot) {
        for span in &data.spans {
            self.process_kernel_span(span);
        }
        self.current_allocs.extend(data.allocations);
    }

    /// Fraction of the device's thread-seconds used in the measured interval,
    /// before normalization
    pub fn utilization(&self) -> f64 {
        let interval_secs = nanos_to_secs(self.measured_interval_ns);
        if interval_secs <= 0.0 {
            return 0.0;
        }

        let available_thread_seconds = self.max_threads as f64 * interval_secs;
        self.total_thread_seconds_used / available_thread_seconds
    }

    pub fn set_normalization_factor(&mut self, factor: f64) {
        self.utilization_norm_factor = Some(factor);
    }

    /// Build the stats for the measured interval and reset for the next one.
    ///
    /// Fails without touching any state if the interval is non-empty and no
    /// positive normalization factor has been set.
    pub fn report(&mut self) -> Result<ProcessStats> {
        let utilization_percentage = if self.measured_interval_ns > 0 {
            match self.utilization_norm_factor {
                Some(factor) if factor > 0.0 => self.utilization() / factor,
                _ => {
                    return Err(GpuError::MissingNormalizationFactor {
                        interval_ns: self.measured_interval_ns,
                    })
                }
            }
        } else {
            0.0
        };

        let mut mem_ts = TimeSeriesBuilder::new();
        for alloc in &self.current_allocs {
            mem_ts.add_open_event(alloc.start_ktime, bytes_as_i64(alloc.size));
        }
        for alloc in &self.past_allocs {
            // Past allocations are closed by construction; treat a missing end as live
            match alloc.end_ktime {
                Some(end) => {
                    mem_ts.add_closed_event(alloc.start_ktime, end, bytes_as_i64(alloc.size))
                }
                None => mem_ts.add_open_event(alloc.start_ktime, bytes_as_i64(alloc.size)),
            }
        }
        let (last, max) = mem_ts.last_and_max();

        let stats = ProcessStats {
            utilization_percentage,
            current_memory_bytes: u64::try_from(last).unwrap_or(0),
            max_memory_bytes: u64::try_from(max).unwrap_or(0),
        };

        debug!(
            "Interval ending at {}: {:.3} thread-seconds, {} past and {} live allocations",
            self.interval_end_ktime,
            self.total_thread_seconds_used,
            self.past_allocs.len(),
            self.current_allocs.len()
        );
        self.flush_processed_stats();

        Ok(stats)
    }

    fn flush_processed_stats(&mut self) {
        self.past_allocs.clear();
        self.total_thread_seconds_used = 0.0;
        self.last_check_ktime = self.interval_end_ktime;
    }
}

fn bytes_as_i64(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}
