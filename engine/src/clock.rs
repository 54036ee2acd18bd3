//! Send-intent clock.
//!
//! Offline messages are stamped with the time the change was made. Wall
//! clocks can stall or step backwards, so the clock never hands out the same
//! value twice and never goes back.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// A monotonic millisecond clock.
///
/// `next(now)` returns `max(now, last + 1)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendClock {
    /// Last value handed out
    pub last: Timestamp,
}

impl SendClock {
    /// Create a clock that has handed out nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock resuming after `last`.
    pub fn with_last(last: Timestamp) -> Self {
        Self { last }
    }

    /// Stamp a change made at wall time `now`.
    pub fn next(&mut self, now: Timestamp) -> Timestamp {
        let stamp = now.max(self.last.saturating_add(1));
        self.last = stamp;
        stamp
    }
}
