//! Fixed-interval frame timing.
//!
//! Maps frame numbers to wall-clock deadlines. The nominal interval is 50 ms
//! (20 frames per second); a room that falls behind shrinks the interval to
//! catch up and one that runs hot stretches it, clamped so the simulation
//! never runs more than 25% fast or 32% slow.

use crate::Frame;

/// Nominal frame interval, ms.
pub const FRAME_INTERVAL_MS: u64 = 50;

/// Fastest allowed interval when catching up.
pub const MIN_INTERVAL_MS: u64 = 40;

/// Slowest allowed interval when throttling.
pub const MAX_INTERVAL_MS: u64 = 66;

/// Converts between frames and milliseconds from a fixed epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTimeCounter {
    start_time_ms: u64,
    start_frame: Frame,
    interval_ms: u64,
}

impl FixedTimeCounter {
    /// Creates a counter whose `start_frame` is due at `start_time_ms`.
    #[must_use]
    pub fn new(start_time_ms: u64, start_frame: Frame) -> Self {
        Self::with_interval(start_time_ms, start_frame, FRAME_INTERVAL_MS)
    }

    /// Like [`FixedTimeCounter::new`] with an explicit interval. Unlike
    /// [`FixedTimeCounter::change_interval`] the value is not clamped; the
    /// band only constrains mid-run speed adjustments.
    #[must_use]
    pub fn with_interval(start_time_ms: u64, start_frame: Frame, interval_ms: u64) -> Self {
        FixedTimeCounter {
            start_time_ms,
            start_frame,
            interval_ms: interval_ms.max(1),
        }
    }

    /// The wall-clock deadline of `frame`.
    #[must_use]
    pub fn frame_time(&self, frame: Frame) -> u64 {
        let delta = i64::from(frame - self.start_frame);
        if delta <= 0 {
            return self.start_time_ms;
        }
        self.start_time_ms + delta as u64 * self.interval_ms
    }

    /// Current interval, ms.
    #[must_use]
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Re-bases the counter at `frame`/`now_ms` and applies a new interval,
    /// clamped to the allowed band. Re-basing keeps already-elapsed frames'
    /// deadlines stable when the interval changes mid-run.
    pub fn change_interval(&mut self, interval_ms: u64, frame: Frame, now_ms: u64) {
        self.start_time_ms = now_ms;
        self.start_frame = frame;
        self.interval_ms = interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
    }

    /// The latest frame whose deadline is at or before `now_ms`.
    #[must_use]
    pub fn frame_due(&self, now_ms: u64) -> Frame {
        if now_ms <= self.start_time_ms {
            return self.start_frame;
        }
        let elapsed = now_ms - self.start_time_ms;
        self.start_frame + (elapsed / self.interval_ms) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_deadlines_are_linear() {
        let counter = FixedTimeCounter::new(1000, Frame::new(0));
        assert_eq!(counter.frame_time(Frame::new(0)), 1000);
        assert_eq!(counter.frame_time(Frame::new(1)), 1050);
        assert_eq!(counter.frame_time(Frame::new(10)), 1500);
    }

    #[test]
    fn interval_clamped_to_band() {
        let mut counter = FixedTimeCounter::new(0, Frame::new(0));
        counter.change_interval(10, Frame::new(5), 250);
        assert_eq!(counter.interval_ms(), MIN_INTERVAL_MS);
        counter.change_interval(500, Frame::new(5), 250);
        assert_eq!(counter.interval_ms(), MAX_INTERVAL_MS);
    }

    #[test]
    fn rebase_keeps_future_deadlines_relative() {
        let mut counter = FixedTimeCounter::new(0, Frame::new(0));
        counter.change_interval(40, Frame::new(10), 600);
        assert_eq!(counter.frame_time(Frame::new(10)), 600);
        assert_eq!(counter.frame_time(Frame::new(11)), 640);
    }

    #[test]
    fn frame_due_tracks_elapsed_time() {
        let counter = FixedTimeCounter::new(1000, Frame::new(0));
        assert_eq!(counter.frame_due(999), Frame::new(0));
        assert_eq!(counter.frame_due(1049), Frame::new(0));
        assert_eq!(counter.frame_due(1050), Frame::new(1));
        assert_eq!(counter.frame_due(1500), Frame::new(10));
    }
}
