//! Event type definitions for GPU activity
//!
//! These types represent the raw events captured from the CUDA runtime
//! probes and routed by the agent to the per-stream reducers.

use serde::{Deserialize, Serialize};

/// Timestamp in nanoseconds since boot (kernel time)
pub type Timestamp = u64;

/// Process ID
pub type Pid = u32;

/// CUDA stream handle
pub type StreamId = u64;

/// Unique identifier for a CUDA stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub pid: Pid,
    pub stream_id: StreamId,
}

impl StreamKey {
    pub fn new(pid: Pid, stream_id: StreamId) -> Self {
        Self { pid, stream_id }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:#x}", self.pid, self.stream_id)
    }
}

/// CUDA `dim3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Number of elements covered by this dimension
    pub fn volume(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }
}

impl Default for Dim3 {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

/// Kernel launch captured on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelLaunch {
    /// Kernel time of the launch call
    pub ktime_ns: Timestamp,

    /// Number of blocks in the grid
    pub grid_size: Dim3,

    /// Number of threads per block
    pub block_size: Dim3,

    /// Dynamic shared memory requested by the launch, in bytes
    #[serde(default)]
    pub shared_mem_size: u64,
}

impl KernelLaunch {
    /// Total threads requested by this launch (block size x block count)
    pub fn thread_count(&self) -> u64 {
        self.block_size.volume().saturating_mul(self.grid_size.volume())
    }
}

/// Kind of memory event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemEventKind {
    Alloc,
    Free,
}

/// Device memory allocation or free
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemEvent {
    pub ktime_ns: Timestamp,
    pub addr: u64,

    /// Allocation size in bytes. Free events carry 0.
    #[serde(default)]
    pub size: u64,

    pub kind: MemEventKind,
}

/// Decoded GPU event, tagged with the stream it belongs to
///
/// This is the shape of one line in the agent's JSON-lines input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GpuEvent {
    KernelLaunch {
        pid: Pid,
        stream_id: StreamId,
        #[serde(flatten)]
        launch: KernelLaunch,
    },
    Memory {
        pid: Pid,
        stream_id: StreamId,
        #[serde(flatten)]
        event: MemEvent,
    },
    Sync {
        pid: Pid,
        stream_id: StreamId,
        ktime_ns: Timestamp,
    },
    StreamEnd {
        pid: Pid,
        stream_id: StreamId,
    },
    ProcessExit {
        pid: Pid,
    },
}

impl GpuEvent {
    /// Get the process ID of any event type
    pub fn pid(&self) -> Pid {
        match self {
            GpuEvent::KernelLaunch { pid, .. }
            | GpuEvent::Memory { pid, .. }
            | GpuEvent::Sync { pid, .. }
            | GpuEvent::StreamEnd { pid, .. }
            | GpuEvent::ProcessExit { pid } => *pid,
        }
    }

    /// Get the kernel timestamp, for events that carry one
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            GpuEvent::KernelLaunch { launch, .. } => Some(launch.ktime_ns),
            GpuEvent::Memory { event, .. } => Some(event.ktime_ns),
            GpuEvent::Sync { ktime_ns, .. } => Some(*ktime_ns),
            GpuEvent::StreamEnd { .. } | GpuEvent::ProcessExit { .. } => None,
        }
    }

    /// Label used for per-kind counters
    pub fn kind(&self) -> &'static str {
        match self {
            GpuEvent::KernelLaunch { .. } => "kernel_launch",
            GpuEvent::Memory { event, .. } => match event.kind {
                MemEventKind::Alloc => "alloc",
                MemEventKind::Free => "free",
            },
            GpuEvent::Sync { .. } => "sync",
            GpuEvent::StreamEnd { .. } => "stream_end",
            GpuEvent::ProcessExit { .. } => "process_exit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_count() {
        let launch = KernelLaunch {
            ktime_ns: 10,
            grid_size: Dim3::new(4, 2, 1),
            block_size: Dim3::new(32, 4, 1),
            shared_mem_size: 0,
        };
        assert_eq!(launch.thread_count(), 8 * 128);
    }

    #[test]
    fn test_kernel_launch_json_line() {
        let line = r#"{"type":"kernel_launch","pid":42,"stream_id":7,"ktime_ns":1000,"grid_size":{"x":2,"y":1,"z":1},"block_size":{"x":64,"y":1,"z":1}}"#;
        let event: GpuEvent = serde_json::from_str(line).unwrap();

        match event {
            GpuEvent::KernelLaunch {
                pid,
                stream_id,
                launch,
            } => {
                assert_eq!(pid, 42);
                assert_eq!(stream_id, 7);
                assert_eq!(launch.ktime_ns, 1000);
                assert_eq!(launch.thread_count(), 128);
                assert_eq!(launch.shared_mem_size, 0);
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_memory_event_json_line() {
        let line = r#"{"type":"memory","pid":1,"stream_id":0,"ktime_ns":5,"addr":4096,"kind":"free"}"#;
        let event: GpuEvent = serde_json::from_str(line).unwrap();

        assert_eq!(event.kind(), "free");
        assert_eq!(event.timestamp(), Some(5));
        if let GpuEvent::Memory { event, .. } = event {
            assert_eq!(event.size, 0);
            assert_eq!(event.addr, 4096);
        } else {
            panic!("Wrong variant");
        }
    }

    #[test]
    fn test_process_exit_has_no_timestamp() {
        let event: GpuEvent = serde_json::from_str(r#"{"type":"process_exit","pid":9}"#).unwrap();
        assert_eq!(event.pid(), 9);
        assert_eq!(event.timestamp(), None);
    }

    #[test]
    fn test_stream_key_display() {
        assert_eq!(StreamKey::new(12, 255).to_string(), "12/0xff");
    }
}
