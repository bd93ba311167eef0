//! Event input decoding
//!
//! Events arrive as JSON lines, one [`GpuEvent`] per line. Blank lines and
//! `#` comments are skipped; malformed lines are logged and dropped.

use crate::metrics;
use anyhow::{Context, Result};
use gpuscope_shared::types::events::GpuEvent;
use std::path::Path;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::warn;

/// Decode one input line. Returns `None` for lines that carry no event.
pub fn decode_line(line: &str, line_no: u64) -> Option<GpuEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Skipping malformed event on line {}: {}", line_no, e);
            metrics::DECODE_ERRORS.inc();
            None
        }
    }
}

/// Open the event input for async reading: `path`, or stdin when `None`
pub async fn open_input(path: Option<&Path>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open event input: {}", path.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}
