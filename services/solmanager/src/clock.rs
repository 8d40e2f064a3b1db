//! Wall-clock helpers.  All internal time arithmetic is integer
//! microseconds; epoch seconds appear only at object boundaries.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall time as epoch seconds.
pub fn now_epoch() -> i64 {
    now_micros() / 1_000_000
}

/// Current wall time as epoch microseconds.
pub fn now_micros() -> i64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(dur.as_micros()).unwrap_or(i64::MAX)
}
