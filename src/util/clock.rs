//! Wall-clock helpers expressed in milliseconds since the Unix epoch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Absolute deadline `after` from now, in milliseconds since the Unix epoch.
pub fn deadline_after(after: Duration) -> u128 {
    now_ms() + after.as_millis()
}
