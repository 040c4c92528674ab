use chrono::{DateTime, Utc};
use serde::Serialize;

/// Completion report for the post-creation wait window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressInfo {
    /// Linear percentage of the wait window that has elapsed, capped at 100.
    pub percent_complete: u8,
    pub complete: bool,
}

/// Progress through the minimum-wait window that masks directory
/// replication lag. A zero-length window is complete immediately.
pub fn progress(
    create_start_time: DateTime<Utc>,
    minimum_wait_seconds: u64,
    now: DateTime<Utc>,
) -> ProgressInfo {
    if minimum_wait_seconds == 0 {
        return ProgressInfo {
            percent_complete: 100,
            complete: true,
        };
    }

    let elapsed = (now - create_start_time).num_milliseconds().max(0) as u64;
    let window = minimum_wait_seconds * 1000;
    if elapsed >= window {
        return ProgressInfo {
            percent_complete: 100,
            complete: true,
        };
    }

    ProgressInfo {
        percent_complete: (elapsed * 100 / window) as u8,
        complete: false,
    }
}
