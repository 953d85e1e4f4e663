use std::time::Duration;

use chrono::{DateTime, Local};

use crate::clock::EpochMillis;

/// Format a countdown for the expiry warning, e.g. "1m 58s" or "9h 59m"
pub fn format_countdown(remaining: Duration) -> String {
    let total = remaining.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Format an epoch-millisecond timestamp in local time
pub fn format_timestamp(at: EpochMillis) -> String {
    match DateTime::from_timestamp_millis(at) {
        Some(dt) => dt.with_timezone(&Local).format("%b %d, %Y %H:%M:%S").to_string(),
        None => at.to_string(), // Out of chrono's range, show the raw value
    }
}
