//! Wall-clock helpers used to timestamp job events.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch with sub-second precision.
///
/// Event log records carry this value so that log files can be replayed
/// on a common time axis.
#[must_use]
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_secs_advances() {
        let first = now_secs();
        assert!(first > 1_600_000_000.0);
        assert!(now_secs() >= first);
    }
}
