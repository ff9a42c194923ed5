//! Daemon time sources.
//!
//! Protocol code never reads the clock itself: the event loop samples a
//! [`Now`] once per event and passes it down, which keeps the state
//! machines deterministic under test.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// One sample of wall-clock and monotonic time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Now {
    /// Seconds since the Unix epoch.
    pub wall: u64,
    /// Milliseconds since daemon start.
    pub mono: u64,
}

impl Now {
    pub fn at(wall: u64, mono: u64) -> Self {
        Self { wall, mono }
    }
}

/// Monotonic clock anchored at daemon start.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> Now {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Now {
            wall,
            mono: self.start.elapsed().as_millis() as u64,
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
