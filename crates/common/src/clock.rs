//! Clock seam so reservation timestamps are testable.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Source of the nanosecond timestamps written into the
/// `<domain>/<type>-assigned-time` annotation.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u128;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    }
}
