//! Small shared utilities.
//!
//! Currently this is only the wall-clock timestamp helper used to stamp
//! outgoing envelopes. Timestamps on the wire are float seconds since the
//! Unix epoch and are diagnostic only; nothing orders or expires on them.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall clock as float seconds since the Unix epoch.
///
/// A clock set before the epoch yields `0.0` rather than failing; envelope
/// timestamps are not load-bearing.
#[must_use]
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_advance() {
        let a = unix_timestamp();
        let b = unix_timestamp();
        assert!(a > 1.0e9, "wall clock should be past 2001");
        assert!(b >= a);
    }
}
