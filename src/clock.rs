//! Wall-clock access for hosts that do not bring their own.
//!
//! The rest of the crate takes explicit `now_ms: u64` arguments so tests can
//! drive time deterministically; these helpers are what a real host feeds
//! them with. `web-time` stands in for `std::time` so the same code runs on
//! wasm targets.

use web_time::{Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, 0 if the system clock is before it.
#[must_use]
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Monotonic elapsed-time source for service and room ticks.
///
/// Unlike [`unix_now_ms`] this can never jump backwards with NTP
/// adjustments, which matters for KCP's retransmission timers.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    /// Starts counting from now.
    #[must_use]
    pub fn start() -> Self {
        Stopwatch {
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed since [`Stopwatch::start`].
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
