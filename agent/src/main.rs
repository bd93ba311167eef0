//! GPU Accounting Agent
//!
//! Main entry point: consumes decoded CUDA events (kernel launches, memory
//! events, synchronizations, stream/process exits) and writes per-process
//! GPU utilization and memory stats every interval.

use anyhow::Result;
use clap::Parser;
use gpuscope_agent::{Config, RawConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gpuscope-agent")]
#[command(about = "Per-process GPU utilization and memory accounting", long_about = None)]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "GPUSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Reporting interval (e.g., "500ms", "10s", "1m")
    #[arg(short, long)]
    interval: Option<String>,

    /// "live" (wall-clock intervals) or "replay" (event-time intervals)
    #[arg(short, long)]
    mode: Option<String>,

    /// Event input in JSON lines (default: stdin)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Write stats as JSON lines to this file (default: stdout)
    #[arg(long)]
    json: Option<PathBuf>,

    /// Max concurrent threads per device, comma separated
    #[arg(long, value_delimiter = ',')]
    max_threads: Option<Vec<u64>>,

    /// Device the tracked processes run on
    #[arg(long)]
    device: Option<usize>,

    /// Write Prometheus metrics to this file on shutdown
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Command line flags take precedence over file and environment values
    fn apply(self, mut raw: RawConfig) -> RawConfig {
        if self.interval.is_some() {
            raw.interval = self.interval;
        }
        if self.mode.is_some() {
            raw.mode = self.mode;
        }
        if self.input.is_some() {
            raw.input = self.input;
        }
        if self.json.is_some() {
            raw.json_output = self.json;
        }
        if self.max_threads.is_some() {
            raw.device_max_threads = self.max_threads;
        }
        if self.device.is_some() {
            raw.device_index = self.device;
        }
        if self.metrics_out.is_some() {
            raw.metrics_output = self.metrics_out;
        }
        raw
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()
        .map_err(|e| anyhow::anyhow!("Failed to install error report hooks: {}", e))?;

    let args = Args::parse();

    // Stats go to stdout, so logs go to stderr
    init_tracing(args.verbose)?;

    info!("Starting gpuscope agent");
    info!("Arguments: {:?}", args);

    let raw = RawConfig::load(args.config.as_deref())?;
    let config = Config::try_from(args.apply(raw))?;

    gpuscope_agent::run(config).await?;
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_values() {
        let args = Args::try_parse_from([
            "gpuscope-agent",
            "--interval",
            "2s",
            "--max-threads",
            "1024,2048",
            "--device",
            "1",
        ])
        .unwrap();

        let file = RawConfig {
            interval: Some("30s".to_string()),
            mode: Some("replay".to_string()),
            ..Default::default()
        };

        let raw = args.apply(file);
        assert_eq!(raw.interval.as_deref(), Some("2s"));
        assert_eq!(raw.mode.as_deref(), Some("replay"));
        assert_eq!(raw.device_max_threads, Some(vec![1024, 2048]));
        assert_eq!(raw.device_index, Some(1));
    }
}
