//! Capped exponential backoff.

use crate::config::BackoffSettings;
use rand::Rng;
use std::time::Duration;

/// Retry delay policy: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Fraction of the delay added as random jitter (0.0 disables jitter)
    jitter: f64,
}

impl Backoff {
    /// Deterministic backoff.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: 0.0,
        }
    }

    /// Add up to `fraction` of the delay as random jitter, so many workers
    /// reconnecting to the same network do not retry in lockstep.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay.mul_f64(1.0 + extra).min(self.max)
        } else {
            delay
        }
    }

    /// Upper bound of every delay.
    pub fn max(&self) -> Duration {
        self.max
    }
}

impl From<BackoffSettings> for Backoff {
    fn from(settings: BackoffSettings) -> Self {
        Backoff::new(settings.base, settings.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(2), Duration::from_secs(10));
        assert_eq!(backoff.delay(4), Duration::from_secs(40));
        assert_eq!(backoff.delay(5), Duration::from_secs(60));
        assert_eq!(backoff.delay(500), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60)).with_jitter(0.5);
        for attempt in 1..10 {
            let delay = backoff.delay(attempt);
            assert!(delay >= Duration::from_secs(5).min(backoff.max()));
            assert!(delay <= backoff.max());
        }
    }
}
