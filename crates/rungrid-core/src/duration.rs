//! Human duration strings ("30s", "5m", "1h").

use std::time::Duration;

/// Parse a duration string like "30s", "5m", "1h" or a bare number of seconds.
///
/// Returns `None` when the string is not a recognised duration.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, multiplier) = if let Some(v) = s.strip_suffix("ms") {
        return v.trim().parse::<u64>().ok().map(Duration::from_millis);
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3600)
    } else {
        (s, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .map(|n| Duration::from_secs(n * multiplier))
}
