//! JSON output
//!
//! Emits one stats report per interval as a JSON line

use crate::manager::IntervalStats;
use anyhow::{Context, Result};
use gpuscope_shared::types::stats::GpuStats;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

/// Record written for each reporting interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub hostname: String,

    /// Wall-clock time the report was built, RFC 3339
    pub generated_at: String,

    /// Kernel time the interval ended at
    pub end_ktime: u64,

    /// Measured interval length in nanoseconds
    pub interval_ns: i64,

    pub stats: GpuStats,
}

impl StatsReport {
    pub fn new(hostname: &str, interval: IntervalStats) -> Self {
        Self {
            hostname: hostname.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            end_ktime: interval.end_ktime,
            interval_ns: interval.interval_ns(),
            stats: interval.stats,
        }
    }
}

/// Hostname to tag reports with
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Writes stats reports as JSON lines to a file or stdout
pub struct StatsWriter {
    writer: Box<dyn Write + Send>,
    reports: u64,
}

impl StatsWriter {
    /// Write to `path`, or stdout when `None`
    pub fn create(path: Option<&Path>) -> Result<Self> {
        let writer: Box<dyn Write + Send> = match path {
            Some(path) => {
                info!("Writing stats to {}", path.display());
                let file = File::create(path)
                    .with_context(|| format!("Failed to create output file: {}", path.display()))?;
                Box::new(BufWriter::new(file))
            }
            None => Box::new(BufWriter::new(std::io::stdout())),
        };

        Ok(Self { writer, reports: 0 })
    }

    pub fn write_report(&mut self, report: &StatsReport) -> Result<()> {
        serde_json::to_writer(&mut self.writer, report)
            .context("Failed to serialize stats report to JSON")?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().context("Failed to flush stats output")?;

        self.reports += 1;
        debug!(
            "Wrote report {} with {} processes",
            self.reports,
            report.stats.pid_stats.len()
        );
        Ok(())
    }

    /// Number of reports written so far
    pub fn reports_written(&self) -> u64 {
        self.reports
    }
}
