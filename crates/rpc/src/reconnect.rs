//! Reconnect policy with jittered exponential back-off.

use std::time::Duration;

/// Controls how the client role reconnects after a connection drop.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Initial delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (cap).
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_factor: f64,
    /// Randomization factor in `[0, 1]`: each delay is stretched by up to
    /// `jitter * delay` to spread reconnect storms.
    pub jitter: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectBackoff {
    /// Compute the delay for the given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter = capped_ms * self.jitter.clamp(0.0, 1.0) * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure — just enough to spread reconnect storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let p = ReconnectBackoff::default();
        assert_eq!(p.initial_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(60));
        assert_eq!(p.backoff_factor, 2.0);
    }

    #[test]
    fn delay_grows_with_backoff() {
        let p = ReconnectBackoff::default();
        let d0 = p.delay_for_attempt(0);
        let d1 = p.delay_for_attempt(1);
        let d2 = p.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_at_max() {
        let p = ReconnectBackoff {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            backoff_factor: 10.0,
            jitter: 0.25,
        };
        let d = p.delay_for_attempt(10);
        // Should not exceed max_delay + 25% jitter.
        assert!(d <= Duration::from_millis(37_500));
    }

    #[test]
    fn zero_jitter_is_exact() {
        let p = ReconnectBackoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.0,
        };
        assert_eq!(p.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(8));
    }
}
