use std::time::Duration;

/// Floor for the reconnect delay.
const MIN_DELAY: Duration = Duration::from_millis(100);

/// Capped exponential reconnect delay: `base`, `2 * base`, `4 * base`, ...
/// never exceeding `max` and never below `base`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_DELAY);
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Back to `base` after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
