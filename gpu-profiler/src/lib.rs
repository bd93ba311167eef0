//! GPU usage accounting
//!
//! Turns the raw CUDA event stream of each process into per-interval
//! utilization and memory statistics:
//!
//! - [`stream::StreamHandler`] reduces the events of one stream into kernel
//!   spans and allocation lifetimes
//! - [`aggregator::Aggregator`] combines the data of every stream of a
//!   process into [`ProcessStats`]
//! - [`tseries::TimeSeriesBuilder`] derives current and peak memory from
//!   overlapping allocations

pub mod aggregator;
pub mod capacity;
pub mod error;
pub mod stream;
pub mod tseries;

pub use aggregator::Aggregator;
pub use capacity::{Clock, DeviceCapacity, ManualClock, MonotonicClock, SystemContext};
pub use error::{GpuError, Result};
pub use gpuscope_shared::types::stats::ProcessStats;
pub use stream::{
    KernelSpan, MemEventOutcome, MemoryAllocation, StreamHandler, StreamSnapshot, StreamState,
};
