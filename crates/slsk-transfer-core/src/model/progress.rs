//! Speed and ETA sampling.

use std::time::{Duration, Instant};

/// Tracks where a transfer started so speed can be derived from elapsed time.
///
/// Speed stays unknown until time has passed and bytes beyond the starting
/// offset have moved.
#[derive(Debug, Clone, Default)]
pub struct ProgressSampler {
    started_at: Option<Instant>,
    offset_at_start: u64,
    speed: Option<f64>,
}

impl ProgressSampler {
    /// Start measuring from `offset`.
    pub fn start(&mut self, offset: u64, now: Instant) {
        self.started_at = Some(now);
        self.offset_at_start = offset;
        self.speed = None;
    }

    /// Forget the current measurement.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Update the speed estimate for `current` bytes at `now`.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&mut self, current: u64, now: Instant) -> Option<f64> {
        let started_at = self.started_at?;
        let elapsed = now.saturating_duration_since(started_at).as_secs_f64();
        if elapsed > 0.0 && current > self.offset_at_start {
            self.speed = Some((current - self.offset_at_start) as f64 / elapsed);
        }
        self.speed
    }

    /// Latest speed in bytes per second.
    #[must_use]
    pub const fn speed(&self) -> Option<f64> {
        self.speed
    }

    #[cfg(test)]
    const fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Time left to move `size - current` bytes at the latest speed.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn eta(&self, size: u64, current: u64) -> Option<Duration> {
        let speed = self.speed.filter(|speed| *speed > 0.0)?;
        let remaining = size.saturating_sub(current) as f64;
        Some(Duration::from_secs((remaining / speed).ceil() as u64))
    }
}
