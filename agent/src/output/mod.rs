//! Output generation for interval stats

pub mod json;

pub use json::{local_hostname, StatsReport, StatsWriter};
