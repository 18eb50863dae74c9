//! Adaptive retry pacing
//!
//! Delays grow linearly with the attempt number and scale with the
//! observed round-trip time to the durable store, so retry pressure tracks
//! actual network conditions instead of a fixed schedule.

use rand::Rng;
use std::time::Duration;

/// Floor for a single retry delay
pub const MIN_DELAY: Duration = Duration::from_millis(50);
/// Ceiling for a single retry delay
pub const MAX_DELAY: Duration = Duration::from_millis(2000);
/// Linear growth per attempt
pub const ATTEMPT_GROWTH: f64 = 1.5;
/// Uniform jitter fraction applied after clamping
pub const JITTER: f64 = 0.25;

/// Linear, ping-scaled backoff schedule
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    min: Duration,
    max: Duration,
    growth: f64,
    jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff {
            min: MIN_DELAY,
            max: MAX_DELAY,
            growth: ATTEMPT_GROWTH,
            jitter: JITTER,
        }
    }
}

impl RetryBackoff {
    /// Schedule with custom clamp bounds (tests shrink these)
    pub fn with_bounds(min: Duration, max: Duration) -> Self {
        RetryBackoff {
            min,
            max,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based: the delay taken after
    /// the first failed attempt uses `attempt = 1`), given the store's
    /// current round-trip estimate.
    pub fn delay(&self, attempt: u32, round_trip: Duration) -> Duration {
        let clamped = self.base_delay(attempt, round_trip);
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(clamped.as_secs_f64() * factor)
    }

    /// The clamped, un-jittered delay for `attempt`
    pub fn base_delay(&self, attempt: u32, round_trip: Duration) -> Duration {
        // One-way latency estimate, scaled back up as the pacing unit
        let base = (round_trip.as_secs_f64() / 2.0) * 2.0;
        let raw = base * (1.0 + self.growth * f64::from(attempt));
        Duration::from_secs_f64(raw.clamp(self.min.as_secs_f64(), self.max.as_secs_f64()))
    }
}
