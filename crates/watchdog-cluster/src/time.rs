//! Wall-clock millisecond timestamps.
//!
//! Ping and pong times are gossiped between nodes, so they use unix
//! milliseconds rather than a process-local monotonic clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sentinel value meaning "never happened".
pub const NEVER: u64 = 0;

/// Returns the current wall-clock time in milliseconds since the unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(NEVER)
}

/// Converts a duration into whole milliseconds, saturating at `u64::MAX`.
#[inline]
pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Milliseconds elapsed between `since` and `now`, or `None` when `since`
/// is the [`NEVER`] sentinel.
#[inline]
pub fn elapsed_since(since: u64, now: u64) -> Option<u64> {
    if since == NEVER {
        None
    } else {
        Some(now.saturating_sub(since))
    }
}
