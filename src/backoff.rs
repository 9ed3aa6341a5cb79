use rand::Rng;
use std::time::Duration;

/// Doubling delay between worker retry attempts, capped and jittered.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    /// Extra random delay of up to `jitter_percent` of the capped delay.
    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent.min(100);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_ms.saturating_mul(2u64.saturating_pow(attempt.min(20)));
        let capped = exponential.min(self.max_ms);
        let spread = capped.saturating_mul(self.jitter_percent) / 100;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let backoff = ExponentialBackoff::new(100, 10_000).with_jitter(0);
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn test_max_cap() {
        let backoff = ExponentialBackoff::new(100, 1000).with_jitter(0);
        assert_eq!(backoff.delay(10).as_millis(), 1000);
        assert_eq!(backoff.delay(u32::MAX).as_millis(), 1000);
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = ExponentialBackoff::new(1000, 1000).with_jitter(20);
        for attempt in 0..50 {
            let ms = backoff.delay(attempt).as_millis();
            assert!((1000..=1200).contains(&ms), "delay {ms} out of range");
        }
    }
}
