//! Hybrid logical clock for `accepted_at` timestamps
//!
//! - Local event: `physical = max(wall, last.physical)`; the logical counter
//!   resets when physical advances and increments otherwise.
//! - Observe: folds in an externally known timestamp (e.g. the tail entry
//!   recovered on startup) so later timestamps stay strictly greater.

use crate::types::LogicalTime;
use chrono::Utc;
use parking_lot::Mutex;

/// Monotonic hybrid logical clock
#[derive(Debug, Default)]
pub struct HybridClock {
    last: Mutex<LogicalTime>,
}

impl HybridClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock that never issues a timestamp at or before `floor`
    pub fn starting_after(floor: LogicalTime) -> Self {
        Self {
            last: Mutex::new(floor),
        }
    }

    /// Next timestamp, strictly greater than every previous one
    pub fn now(&self) -> LogicalTime {
        self.tick(Self::wall_clock_ms())
    }

    /// Fold in an observed timestamp
    pub fn observe(&self, seen: LogicalTime) {
        let mut last = self.last.lock();
        if seen > *last {
            *last = seen;
        }
    }

    fn tick(&self, wall: u64) -> LogicalTime {
        let mut last = self.last.lock();

        let next = if wall > last.physical_ms {
            LogicalTime::new(wall, 0)
        } else {
            LogicalTime::new(last.physical_ms, last.logical.saturating_add(1))
        };

        *last = next;
        next
    }

    fn wall_clock_ms() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}
