//! GPU Accounting Agent Library
//!
//! Routes decoded CUDA events to per-stream reducers and reports
//! per-process GPU utilization and memory usage every interval.

pub mod config;
pub mod manager;
pub mod metrics;
pub mod output;
pub mod replay;
pub mod source;

pub use config::{Config, RawConfig, RunMode};
pub use manager::{IntervalStats, ProcessState, StreamManager};

use anyhow::{Context, Result};
use gpuscope_gpu::{Clock, DeviceCapacity, MonotonicClock, SystemContext};
use output::{StatsReport, StatsWriter};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Run the agent with the given configuration.
pub async fn run(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let result = match config.mode {
        RunMode::Live => run_live(&config).await,
        RunMode::Replay => run_replay(&config),
    };

    if let Some(ref path) = config.metrics_output {
        write_metrics(path)?;
    }

    result
}

/// Read events as they arrive and report every `config.interval` of wall-clock time
async fn run_live(config: &Config) -> Result<()> {
    info!(
        "Reporting every {:?} for device {} ({} max threads)",
        config.interval,
        config.device_index,
        config.device_max_threads[config.device_index]
    );

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
    let sys_ctx: Arc<dyn DeviceCapacity> =
        Arc::new(SystemContext::new(config.device_max_threads.clone()));
    let mut manager = StreamManager::new(sys_ctx, config.device_index, clock.clone())
        .context("Failed to create stream manager")?;

    let hostname = output::local_hostname();
    let mut writer = StatsWriter::create(config.json_output.as_deref())?;

    let mut lines = source::open_input(config.input.as_deref()).await?.lines();
    let mut line_no = 0u64;

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read event input")? {
                    Some(line) => {
                        line_no += 1;
                        if let Some(event) = source::decode_line(&line, line_no) {
                            manager.handle_event(event)?;
                        }
                    }
                    None => {
                        info!("Event input closed after {} lines", line_no);
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                let now = clock.now_ns()?;
                let interval = manager.collect_stats(now)?;
                writer.write_report(&StatsReport::new(&hostname, interval))?;
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
                break;
            }
        }
    }

    // Flush trailing spans and leaks as one last report
    manager.end_all()?;
    let now = clock.now_ns()?;
    let interval = manager.collect_stats(now)?;
    writer.write_report(&StatsReport::new(&hostname, interval))?;

    info!("Wrote {} reports", writer.reports_written());
    Ok(())
}

/// Replay a recorded event log, cutting intervals on event time
fn run_replay(config: &Config) -> Result<()> {
    let Some(ref input) = config.input else {
        anyhow::bail!("Replay mode requires an input file");
    };

    let file = std::fs::File::open(input)
        .with_context(|| format!("Failed to open event input: {}", input.display()))?;
    let hostname = output::local_hostname();
    let mut writer = StatsWriter::create(config.json_output.as_deref())?;

    replay::replay(std::io::BufReader::new(file), config, |interval| {
        writer.write_report(&StatsReport::new(&hostname, interval))
    })?;

    Ok(())
}

fn write_metrics(path: &Path) -> Result<()> {
    std::fs::write(path, metrics::encode_metrics())
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    info!("Metrics written to {}", path.display());
    Ok(())
}
