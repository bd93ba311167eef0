//! Per-stream event reducer
//!
//! A [`StreamHandler`] receives the raw events of a single CUDA stream and
//! turns them into kernel spans (closed at synchronization points) and
//! memory allocation lifetimes.

use crate::capacity::Clock;
use crate::error::Result;
use gpuscope_shared::types::events::{KernelLaunch, MemEvent, MemEventKind, StreamKey, Timestamp};
use std::collections::HashMap;
use tracing::{debug, warn};

/// A span of time during which one or more kernels were running on the GPU
/// until a synchronization event happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSpan {
    /// Kernel time of the first launch folded into the span
    pub start_ktime: Timestamp,

    /// Kernel time of the synchronization that closed the span
    pub end_ktime: Timestamp,

    /// Average number of threads requested per launch
    pub avg_thread_count: u64,

    /// Number of launches folded into the span, always at least 1
    pub num_kernels: u64,
}

/// Lifetime of one device memory allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAllocation {
    pub start_ktime: Timestamp,

    /// `None` while the allocation is still live
    pub end_ktime: Option<Timestamp>,

    /// Size in bytes
    pub size: u64,

    /// The stream ended before the allocation was freed
    pub is_leaked: bool,
}

/// Spans and allocations handed from a stream to its process aggregator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub spans: Vec<KernelSpan>,
    pub allocations: Vec<MemoryAllocation>,
}

impl StreamSnapshot {
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty() && self.allocations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Active,
    Ended,
}

/// What happened to a memory event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemEventOutcome {
    /// Allocation is now pending
    Allocated,
    /// Allocation replaced a pending one at the same address
    Reallocated,
    /// Free matched a pending allocation and closed it
    Freed,
    /// Free without a matching allocation; dropped
    OrphanFree,
    /// Stream already ended; dropped
    Ignored,
}

/// Receives events from a single CUDA stream and generates stats from them
#[derive(Debug)]
pub struct StreamHandler {
    key: StreamKey,
    state: StreamState,
    kernel_launches: Vec<KernelLaunch>,
    mem_alloc_events: HashMap<u64, MemEvent>,
    kernel_spans: Vec<KernelSpan>,
    allocations: Vec<MemoryAllocation>,
}

impl StreamHandler {
    pub fn new(key: StreamKey) -> Self {
        Self {
            key,
            state: StreamState::Active,
            kernel_launches: Vec::new(),
            mem_alloc_events: HashMap::new(),
            kernel_spans: Vec::new(),
            allocations: Vec::new(),
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == StreamState::Ended
    }

    /// Number of allocations waiting for a free
    pub fn pending_allocations(&self) -> usize {
        self.mem_alloc_events.len()
    }

    pub fn handle_kernel_launch(&mut self, launch: KernelLaunch) {
        if self.is_ended() {
            debug!("Ignoring kernel launch on ended stream {}", self.key);
            return;
        }
        self.kernel_launches.push(launch);
    }

    pub fn handle_mem_event(&mut self, event: MemEvent) -> MemEventOutcome {
        if self.is_ended() {
            debug!("Ignoring memory event on ended stream {}", self.key);
            return MemEventOutcome::Ignored;
        }

        match event.kind {
            MemEventKind::Alloc => match self.mem_alloc_events.insert(event.addr, event) {
                Some(previous) => {
                    debug!(
                        "Stream {}: address {:#x} re-allocated (previous at {}ns, {} bytes)",
                        self.key, event.addr, previous.ktime_ns, previous.size
                    );
                    MemEventOutcome::Reallocated
                }
                None => MemEventOutcome::Allocated,
            },
            MemEventKind::Free => {
                let Some(alloc) = self.mem_alloc_events.remove(&event.addr) else {
                    warn!(
                        "Invalid free event on stream {}: no allocation for address {:#x} at {}ns",
                        self.key, event.addr, event.ktime_ns
                    );
                    return MemEventOutcome::OrphanFree;
                };

                self.allocations.push(MemoryAllocation {
                    start_ktime: alloc.ktime_ns,
                    end_ktime: Some(event.ktime_ns),
                    size: alloc.size,
                    is_leaked: false,
                });
                MemEventOutcome::Freed
            }
        }
    }

    /// Close the running kernel span at `ts`.
    ///
    /// Launches at or after `ts` stay pending for the next span.
    pub fn synchronize(&mut self, ts: Timestamp) {
        let Some(span) = self.current_kernel_span(ts) else {
            return;
        };

        debug!(
            "Stream {}: closed span [{}, {}] with {} kernels",
            self.key, span.start_ktime, span.end_ktime, span.num_kernels
        );
        self.kernel_spans.push(span);
        self.kernel_launches.retain(|launch| launch.ktime_ns >= ts);
    }

    fn current_kernel_span(&self, max_time: Timestamp) -> Option<KernelSpan> {
        let mut start_ktime = Timestamp::MAX;
        let mut total_threads = 0u64;
        let mut num_kernels = 0u64;

        // Launches after the boundary belong to the next span
        for launch in self
            .kernel_launches
            .iter()
            .filter(|launch| launch.ktime_ns < max_time)
        {
            start_ktime = start_ktime.min(launch.ktime_ns);
            total_threads = total_threads.saturating_add(launch.thread_count());
            num_kernels += 1;
        }

        if num_kernels == 0 {
            return None;
        }

        Some(KernelSpan {
            start_ktime,
            end_ktime: max_time,
            avg_thread_count: total_threads / num_kernels,
            num_kernels,
        })
    }

    /// Spans closed by a synchronization and allocations that were freed
    /// (or leaked at stream end). `flush` hands them over and clears them.
    pub fn get_past_data(&mut self, flush: bool) -> Option<StreamSnapshot> {
        if self.kernel_spans.is_empty() && self.allocations.is_empty() {
            return None;
        }

        if flush {
            Some(StreamSnapshot {
                spans: std::mem::take(&mut self.kernel_spans),
                allocations: std::mem::take(&mut self.allocations),
            })
        } else {
            Some(StreamSnapshot {
                spans: self.kernel_spans.clone(),
                allocations: self.allocations.clone(),
            })
        }
    }

    /// The running span as of `now` and every live allocation. Nothing is
    /// consumed; the same data shows up again next interval.
    pub fn get_current_data(&self, now: Timestamp) -> Option<StreamSnapshot> {
        if self.kernel_launches.is_empty() && self.mem_alloc_events.is_empty() {
            return None;
        }

        let spans = self.current_kernel_span(now).into_iter().collect();
        let allocations = self
            .mem_alloc_events
            .values()
            .map(|alloc| MemoryAllocation {
                start_ktime: alloc.ktime_ns,
                end_ktime: None,
                size: alloc.size,
                is_leaked: false,
            })
            .collect();

        // Launches all stamped after `now` leave nothing to report yet
        let snapshot = StreamSnapshot { spans, allocations };
        (!snapshot.is_empty()).then_some(snapshot)
    }

    /// Mark the stream as closed (process exited or stream destroyed), using
    /// `clock` for the closing timestamp.
    pub fn mark_end(&mut self, clock: &dyn Clock) -> Result<()> {
        let now = clock.now_ns()?;
        self.mark_end_at(now);
        Ok(())
    }

    /// Mark the stream as closed at `now`. The trailing span is closed and
    /// every allocation that was never freed is recorded as a leak ending at
    /// `now`. Idempotent.
    pub fn mark_end_at(&mut self, now: Timestamp) {
        if self.is_ended() {
            return;
        }

        self.synchronize(now);
        self.state = StreamState::Ended;

        if !self.kernel_launches.is_empty() {
            debug!(
                "Stream {}: dropping {} launches stamped after end time {}",
                self.key,
                self.kernel_launches.len(),
                now
            );
            self.kernel_launches.clear();
        }

        for (_, alloc) in self.mem_alloc_events.drain() {
            self.allocations.push(MemoryAllocation {
                start_ktime: alloc.ktime_ns,
                end_ktime: Some(now),
                size: alloc.size,
                is_leaked: true,
            });
        }
    }
}
