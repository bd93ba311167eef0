//! Shared types and utilities for gpuscope
//!
//! This crate contains the event and statistics types exchanged between the
//! agent and the GPU accounting core, plus small time helpers.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{events::*, stats::*};
