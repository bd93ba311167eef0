//! Error types for the GPU accounting core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    /// `report()` was asked to normalize a non-empty interval without a factor
    #[error("utilization normalization factor not set for a {interval_ns}ns interval")]
    MissingNormalizationFactor { interval_ns: i64 },

    #[error("device {0} is not known to the capacity provider")]
    UnknownDevice(usize),

    #[error("device {0} reports zero thread capacity")]
    InvalidCapacity(usize),

    #[error("failed to read kernel clock: {0}")]
    Clock(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GpuError>;
