//! Deterministic replay of recorded event logs
//!
//! Intervals are cut on event time rather than wall-clock time: the first
//! timestamped event opens the first interval, and a report is produced
//! every `interval` of kernel time after it. Streams still open at the end
//! of the log are closed at the last seen timestamp.

use crate::config::Config;
use crate::manager::{IntervalStats, StreamManager};
use crate::source::decode_line;
use anyhow::{Context, Result};
use gpuscope_gpu::{Clock, DeviceCapacity, ManualClock, SystemContext};
use gpuscope_shared::utils::time::duration_nanos;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, info};

/// Counts from a finished replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: u64,
    pub reports: u64,
}

/// Replay every event in `reader`, handing each interval's stats to `sink`
pub fn replay<R, F>(reader: R, config: &Config, mut sink: F) -> Result<ReplaySummary>
where
    R: BufRead,
    F: FnMut(IntervalStats) -> Result<()>,
{
    let interval_ns = u64::try_from(duration_nanos(config.interval)).unwrap_or(u64::MAX);
    if interval_ns == 0 {
        anyhow::bail!("Interval must be greater than 0");
    }

    let clock = Arc::new(ManualClock::new(0));
    let sys_ctx: Arc<dyn DeviceCapacity> =
        Arc::new(SystemContext::new(config.device_max_threads.clone()));

    let mut manager: Option<StreamManager> = None;
    let mut summary = ReplaySummary::default();

    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read event input")?;
        let Some(event) = decode_line(&line, idx as u64 + 1) else {
            continue;
        };
        let ts = event.timestamp();

        if manager.is_none() {
            // Stream and process ends carry no time and close nothing yet
            let Some(start) = ts else {
                debug!(
                    "Skipping {} for pid {} before the first timestamped event",
                    event.kind(),
                    event.pid()
                );
                continue;
            };
            clock.set(start);
            manager = Some(
                StreamManager::new(sys_ctx.clone(), config.device_index, clock.clone())
                    .context("Failed to create stream manager")?,
            );
            info!("Replay starts at ktime {}", start);
        }
        let Some(mgr) = manager.as_mut() else {
            continue;
        };

        if let Some(ts) = ts {
            loop {
                let last_check = mgr.last_check_ktime();
                let boundary = last_check.saturating_add(interval_ns);
                if ts < boundary || boundary == last_check {
                    break;
                }
                clock.advance_to(boundary);
                sink(mgr.collect_stats(boundary)?)?;
                summary.reports += 1;
            }
            clock.advance_to(ts);
        }

        mgr.handle_event(event)?;
        summary.events += 1;
    }

    if let Some(mgr) = manager.as_mut() {
        mgr.end_all()?;
        let now = clock.now_ns()?;
        sink(mgr.collect_stats(now)?)?;
        summary.reports += 1;
    }

    info!(
        "Replay finished: {} events, {} reports",
        summary.events, summary.reports
    );
    Ok(summary)
}
