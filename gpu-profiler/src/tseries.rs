//! Sweep-line accumulator over interval-bounded quantities
//!
//! Used to turn a set of memory allocations (some still open, some closed)
//! into the amount of memory held at the end of the interval and the peak
//! amount held at any point inside it.

use gpuscope_shared::types::events::Timestamp;

/// Builds a step function out of `(timestamp, delta)` points.
///
/// Write-then-read: feed every event, then consume the builder with
/// [`TimeSeriesBuilder::last_and_max`].
#[derive(Debug, Default, Clone)]
pub struct TimeSeriesBuilder {
    deltas: Vec<(Timestamp, i64)>,
}

impl TimeSeriesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quantity `value` becomes active at `start` and stays active until the
    /// end of the observed window.
    pub fn add_open_event(&mut self, start: Timestamp, value: i64) {
        self.deltas.push((start, value));
    }

    /// Quantity `value` is active during `[start, end)` only.
    pub fn add_closed_event(&mut self, start: Timestamp, end: Timestamp, value: i64) {
        self.deltas.push((start, value));
        self.deltas.push((end, -value));
    }

    /// Returns the value at the last timestamp and the maximum value reached.
    ///
    /// All deltas sharing a timestamp are applied together before the
    /// running value is compared against the maximum, so a release and an
    /// acquisition at the same instant never count as overlapping.
    pub fn last_and_max(mut self) -> (i64, i64) {
        self.deltas.sort_unstable_by_key(|&(ts, _)| ts);

        let mut current = 0i64;
        let mut max = 0i64;
        let mut points = self.deltas.iter().peekable();

        while let Some(&(ts, delta)) = points.next() {
            current += delta;
            if matches!(points.peek(), Some(&&(next_ts, _)) if next_ts == ts) {
                continue;
            }
            max = max.max(current);
        }

        (current, max)
    }
}
