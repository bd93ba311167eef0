//! Routing of GPU events to stream handlers and interval reporting
//!
//! The manager owns the `StreamKey -> StreamHandler` and
//! `Pid -> Aggregator` tables, and drives the per-interval handoff between
//! them.

use crate::metrics;
use gpuscope_gpu::{Aggregator, Clock, DeviceCapacity, GpuError, MemEventOutcome, StreamHandler};
use gpuscope_shared::types::events::{GpuEvent, Pid, StreamKey, Timestamp};
use gpuscope_shared::types::stats::GpuStats;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle of a tracked process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// At least one stream may still produce events
    Active,
    /// Every stream ended; one last report is pending
    Ended,
    /// Final report emitted; the process is dropped
    Terminated,
}

#[derive(Debug)]
struct ProcessEntry {
    aggregator: Aggregator,
    state: ProcessState,
}

/// Stats for one reporting interval
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalStats {
    pub start_ktime: Timestamp,
    pub end_ktime: Timestamp,
    pub stats: GpuStats,
}

impl IntervalStats {
    pub fn interval_ns(&self) -> i64 {
        self.end_ktime as i64 - self.start_ktime as i64
    }
}

pub struct StreamManager {
    sys_ctx: Arc<dyn DeviceCapacity>,
    device_index: usize,
    clock: Arc<dyn Clock>,
    streams: HashMap<StreamKey, StreamHandler>,
    processes: HashMap<Pid, ProcessEntry>,
    last_check_ktime: Timestamp,
}

impl StreamManager {
    /// Create a manager whose first interval starts now
    pub fn new(
        sys_ctx: Arc<dyn DeviceCapacity>,
        device_index: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, GpuError> {
        match sys_ctx.max_threads(device_index) {
            None => return Err(GpuError::UnknownDevice(device_index)),
            Some(0) => return Err(GpuError::InvalidCapacity(device_index)),
            Some(_) => {}
        }

        let last_check_ktime = clock.now_ns()?;

        Ok(Self {
            sys_ctx,
            device_index,
            clock,
            streams: HashMap::new(),
            processes: HashMap::new(),
            last_check_ktime,
        })
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn process_state(&self, pid: Pid) -> Option<ProcessState> {
        self.processes.get(&pid).map(|p| p.state)
    }

    pub fn last_check_ktime(&self) -> Timestamp {
        self.last_check_ktime
    }

    fn stream_mut(&mut self, key: StreamKey) -> &mut StreamHandler {
        self.streams.entry(key).or_insert_with(|| {
            debug!("Tracking new stream {}", key);
            StreamHandler::new(key)
        })
    }

    /// Route a decoded event to the handler of its stream
    pub fn handle_event(&mut self, event: GpuEvent) -> Result<(), GpuError> {
        metrics::EVENTS_TOTAL.with_label_values(&[event.kind()]).inc();

        match event {
            GpuEvent::KernelLaunch {
                pid,
                stream_id,
                launch,
            } => {
                self.stream_mut(StreamKey::new(pid, stream_id))
                    .handle_kernel_launch(launch);
            }
            GpuEvent::Memory {
                pid,
                stream_id,
                event,
            } => {
                let outcome = self
                    .stream_mut(StreamKey::new(pid, stream_id))
                    .handle_mem_event(event);
                if outcome == MemEventOutcome::OrphanFree {
                    metrics::ORPHAN_FREES.inc();
                }
            }
            GpuEvent::Sync {
                pid,
                stream_id,
                ktime_ns,
            } => {
                self.stream_mut(StreamKey::new(pid, stream_id))
                    .synchronize(ktime_ns);
            }
            GpuEvent::StreamEnd { pid, stream_id } => {
                self.end_stream(StreamKey::new(pid, stream_id))?;
            }
            GpuEvent::ProcessExit { pid } => {
                self.end_process(pid)?;
            }
        }

        self.update_gauges();
        Ok(())
    }

    /// Close a stream. Unknown streams are ignored.
    pub fn end_stream(&mut self, key: StreamKey) -> Result<(), GpuError> {
        let Some(handler) = self.streams.get_mut(&key) else {
            debug!("End of unknown stream {}", key);
            return Ok(());
        };

        let leaked = handler.pending_allocations();
        handler.mark_end(self.clock.as_ref())?;
        if leaked > 0 {
            info!("Stream {} ended with {} unfreed allocations", key, leaked);
            metrics::LEAKED_ALLOCATIONS.inc_by(leaked as f64);
        }
        Ok(())
    }

    /// Close every stream of a process
    pub fn end_process(&mut self, pid: Pid) -> Result<(), GpuError> {
        let keys: Vec<StreamKey> = self
            .streams
            .keys()
            .filter(|k| k.pid == pid)
            .copied()
            .collect();
        info!("Process {} exited, closing {} streams", pid, keys.len());

        for key in keys {
            self.end_stream(key)?;
        }
        Ok(())
    }

    /// Close every stream, e.g. on shutdown
    pub fn end_all(&mut self) -> Result<(), GpuError> {
        let keys: Vec<StreamKey> = self.streams.keys().copied().collect();
        for key in keys {
            self.end_stream(key)?;
        }
        Ok(())
    }

    /// Build the stats for the interval `[last check, now]` and start the
    /// next one.
    pub fn collect_stats(&mut self, now: Timestamp) -> Result<IntervalStats, GpuError> {
        let timer = metrics::REPORT_DURATION.start_timer();
        let start_ktime = self.last_check_ktime;

        // Every process with a stream gets an aggregator
        for key in self.streams.keys() {
            if !self.processes.contains_key(&key.pid) {
                let aggregator =
                    Aggregator::new(self.sys_ctx.as_ref(), self.device_index, start_ktime)?;
                self.processes.insert(
                    key.pid,
                    ProcessEntry {
                        aggregator,
                        state: ProcessState::Active,
                    },
                );
            }
        }

        for entry in self.processes.values_mut() {
            entry.aggregator.begin_interval(now);
        }

        for (key, handler) in self.streams.iter_mut() {
            let Some(entry) = self.processes.get_mut(&key.pid) else {
                continue;
            };
            if let Some(past) = handler.get_past_data(true) {
                entry.aggregator.absorb_past(past);
            }
            if let Some(current) = handler.get_current_data(now) {
                entry.aggregator.absorb_current(current);
            }
        }

        // Ended streams have been fully drained
        self.streams.retain(|_, handler| !handler.is_ended());

        for (pid, entry) in self.processes.iter_mut() {
            let has_streams = self.streams.keys().any(|k| k.pid == *pid);
            if entry.state == ProcessState::Active && !has_streams {
                entry.state = ProcessState::Ended;
            }
        }

        // Utilization of processes sharing the device can add up to more
        // than 100%; spread it so the total never exceeds the device
        let total_utilization: f64 = self
            .processes
            .values()
            .map(|entry| entry.aggregator.utilization())
            .sum();
        let norm_factor = total_utilization.max(1.0);

        let mut stats = GpuStats::default();
        for (pid, entry) in self.processes.iter_mut() {
            entry.aggregator.set_normalization_factor(norm_factor);
            stats.pid_stats.insert(*pid, entry.aggregator.report()?);

            if entry.state == ProcessState::Ended {
                entry.state = ProcessState::Terminated;
            }
        }

        self.processes.retain(|pid, entry| {
            let keep = entry.state != ProcessState::Terminated;
            if !keep {
                debug!("Process {} terminated", pid);
            }
            keep
        });

        self.last_check_ktime = now;
        self.update_gauges();
        timer.observe_duration();

        Ok(IntervalStats {
            start_ktime,
            end_ktime: now,
            stats,
        })
    }

    fn update_gauges(&self) {
        metrics::ACTIVE_STREAMS.set(self.stream_count() as f64);
        metrics::ACTIVE_PROCESSES.set(self.process_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuscope_gpu::{ManualClock, SystemContext};
    use gpuscope_shared::types::events::{Dim3, KernelLaunch, MemEvent, MemEventKind};

    const SEC: u64 = 1_000_000_000;

    fn manager(max_threads: u64) -> (StreamManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let ctx = Arc::new(SystemContext::new(vec![max_threads]));
        (StreamManager::new(ctx, 0, clock.clone()).unwrap(), clock)
    }

    fn launch(pid: Pid, stream_id: u64, ktime_ns: u64, threads: u32) -> GpuEvent {
        GpuEvent::KernelLaunch {
            pid,
            stream_id,
            launch: KernelLaunch {
                ktime_ns,
                grid_size: Dim3::new(1, 1, 1),
                block_size: Dim3::new(threads, 1, 1),
                shared_mem_size: 0,
            },
        }
    }

    fn sync(pid: Pid, stream_id: u64, ktime_ns: u64) -> GpuEvent {
        GpuEvent::Sync {
            pid,
            stream_id,
            ktime_ns,
        }
    }

    fn mem(pid: Pid, ktime_ns: u64, addr: u64, size: u64, kind: MemEventKind) -> GpuEvent {
        GpuEvent::Memory {
            pid,
            stream_id: 0,
            event: MemEvent {
                ktime_ns,
                addr,
                size,
                kind,
            },
        }
    }

    #[test]
    fn test_unknown_device_rejected() {
        let clock = Arc::new(ManualClock::new(0));
        let ctx = Arc::new(SystemContext::new(vec![100]));
        assert!(StreamManager::new(ctx, 2, clock).is_err());
    }

    #[test]
    fn test_single_process_utilization() {
        let (mut mgr, _clock) = manager(100);
        mgr.handle_event(launch(1, 0, 0, 50)).unwrap();
        mgr.handle_event(sync(1, 0, SEC)).unwrap();

        let interval = mgr.collect_stats(SEC).unwrap();
        assert_eq!(interval.interval_ns(), SEC as i64);

        let stats = interval.stats.pid_stats[&1];
        assert!((stats.utilization_percentage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_oversubscribed_device_is_normalized() {
        let (mut mgr, _clock) = manager(100);
        for pid in [1, 2] {
            mgr.handle_event(launch(pid, 0, 0, 100)).unwrap();
            mgr.handle_event(sync(pid, 0, SEC)).unwrap();
        }

        let stats = mgr.collect_stats(SEC).unwrap().stats;
        assert!((stats.pid_stats[&1].utilization_percentage - 0.5).abs() < 1e-9);
        assert!((stats.pid_stats[&2].utilization_percentage - 0.5).abs() < 1e-9);
        assert!(stats.total_utilization() <= 1.0 + 1e-9);
    }

    #[test]
    fn test_streams_of_a_process_are_combined() {
        let (mut mgr, _clock) = manager(100);
        mgr.handle_event(launch(7, 1, 0, 20)).unwrap();
        mgr.handle_event(launch(7, 2, 0, 30)).unwrap();
        mgr.handle_event(sync(7, 1, SEC)).unwrap();
        mgr.handle_event(sync(7, 2, SEC)).unwrap();
        assert_eq!(mgr.stream_count(), 2);

        let stats = mgr.collect_stats(SEC).unwrap().stats;
        assert_eq!(stats.pid_stats.len(), 1);
        assert!((stats.pid_stats[&7].utilization_percentage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_running_kernel_split_across_intervals() {
        let (mut mgr, _clock) = manager(100);
        mgr.handle_event(launch(1, 0, 0, 100)).unwrap();

        // Still running at the first check
        let first = mgr.collect_stats(SEC).unwrap().stats;
        assert!((first.pid_stats[&1].utilization_percentage - 1.0).abs() < 1e-9);

        // Synchronized half-way through the second interval
        mgr.handle_event(sync(1, 0, SEC + SEC / 2)).unwrap();
        let second = mgr.collect_stats(2 * SEC).unwrap().stats;
        assert!((second.pid_stats[&1].utilization_percentage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_memory_alloc_free_roundtrip() {
        let (mut mgr, _clock) = manager(100);
        mgr.handle_event(mem(3, 10, 0x100, 4096, MemEventKind::Alloc)).unwrap();
        mgr.handle_event(mem(3, 20, 0x100, 0, MemEventKind::Free)).unwrap();

        let stats = mgr.collect_stats(SEC).unwrap().stats.pid_stats[&3];
        assert_eq!(stats.current_memory_bytes, 0);
        assert_eq!(stats.max_memory_bytes, 4096);
    }

    #[test]
    fn test_live_allocation_reported_every_interval() {
        let (mut mgr, _clock) = manager(100);
        mgr.handle_event(mem(3, 10, 0x100, 1000, MemEventKind::Alloc)).unwrap();

        for i in 1..=3 {
            let stats = mgr.collect_stats(i * SEC).unwrap().stats.pid_stats[&3];
            assert_eq!(stats.current_memory_bytes, 1000);
            assert_eq!(stats.max_memory_bytes, 1000);
        }
    }

    #[test]
    fn test_process_exit_reports_leaks_then_terminates() {
        let (mut mgr, clock) = manager(100);
        mgr.handle_event(mem(5, 10, 0x100, 1000, MemEventKind::Alloc)).unwrap();
        mgr.collect_stats(SEC).unwrap();
        assert_eq!(mgr.process_state(5), Some(ProcessState::Active));

        clock.set(SEC + 100);
        mgr.handle_event(GpuEvent::ProcessExit { pid: 5 }).unwrap();

        // Final report: the leak is released at exit time
        let stats = mgr.collect_stats(2 * SEC).unwrap().stats.pid_stats[&5];
        assert_eq!(stats.current_memory_bytes, 0);
        assert_eq!(stats.max_memory_bytes, 1000);

        assert_eq!(mgr.process_state(5), None);
        assert_eq!(mgr.stream_count(), 0);
        assert!(mgr.collect_stats(3 * SEC).unwrap().stats.is_empty());
    }

    #[test]
    fn test_orphan_free_is_not_fatal() {
        let (mut mgr, _clock) = manager(100);
        mgr.handle_event(mem(8, 10, 0xbad, 0, MemEventKind::Free)).unwrap();

        let stats = mgr.collect_stats(SEC).unwrap().stats.pid_stats[&8];
        assert_eq!(stats.max_memory_bytes, 0);
    }

    #[test]
    fn test_end_of_unknown_stream_is_ignored() {
        let (mut mgr, _clock) = manager(100);
        mgr.end_stream(StreamKey::new(1, 1)).unwrap();
        assert_eq!(mgr.stream_count(), 0);
    }
}
