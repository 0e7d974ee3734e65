//! Reconnect backoff policy for the watch loop

use backoff::backoff::Backoff;
use std::time::Duration;

/// Exponent clamp: beyond 2^31 the product saturates at `max` anyway, and the
/// clamp keeps the shift well-defined for arbitrarily long outages.
const MAX_EXPONENT: u32 = 31;

/// Bounded exponential backoff: the n-th consecutive failure waits
/// `min(base * 2^min(n - 1, 31), max)`.
///
/// Deliberately jitter-free and monotone so wait times are exact under test;
/// the cap bounds any reconnect herd. Implements [`Backoff`] so it slots into
/// stream combinators that pause on errors.
#[derive(Clone, Debug)]
pub struct WatchBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl WatchBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Wait before the n-th consecutive reconnect attempt (n >= 1)
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_EXPONENT);
        self.base.saturating_mul(1_u32 << exponent).min(self.max)
    }

    /// Consecutive failures observed since the last successful event
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(800), Duration::from_secs(30))
    }
}

impl Backoff for WatchBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        Some(self.delay_for(self.failures))
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}
