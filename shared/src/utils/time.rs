//! Time-related utilities

use std::time::Duration;

/// Nanoseconds per second
pub const NSEC_PER_SEC: f64 = 1e9;

/// Read `CLOCK_MONOTONIC` in nanoseconds.
///
/// This is the time base of `bpf_ktime_get_ns()`, so the result is directly
/// comparable with event timestamps captured by the probes.
#[cfg(target_os = "linux")]
pub fn monotonic_nanos() -> std::io::Result<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

/// Fallback for platforms without `CLOCK_MONOTONIC`: nanoseconds since the
/// first call in this process.
#[cfg(not(target_os = "linux"))]
pub fn monotonic_nanos() -> std::io::Result<u64> {
    use std::sync::OnceLock;
    use std::time::Instant;

    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    Ok(anchor.elapsed().as_nanos() as u64)
}

/// Convert a nanosecond delta to fractional seconds
pub fn nanos_to_secs(nanos: i64) -> f64 {
    nanos as f64 / NSEC_PER_SEC
}

/// Duration as a signed nanosecond count, saturating at `i64::MAX`
pub fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
