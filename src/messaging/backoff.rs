use std::time::Duration;

/// Exponential, capped, jittered delay schedule for connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Attempts per connection episode before giving up.
    pub max_attempts: u32,
    /// Shave up to 25% off each delay so reconnecting consumers spread out.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(32)).unwrap_or(32);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);

        let delay = if self.jitter {
            capped * (1.0 - 0.25 * rand::random::<f64>())
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts: 10,
            jitter,
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = policy(false);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(40));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy(false);
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let jittered = policy(true);
        let plain = policy(false);
        for attempt in 0..12 {
            let upper = plain.delay_for_attempt(attempt);
            let delay = jittered.delay_for_attempt(attempt);
            assert!(delay <= upper);
            assert!(delay >= upper.mul_f64(0.75));
        }
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let mut policy = policy(false);
        policy.max_attempts = 0;
        assert_eq!(policy.attempts(), 1);
    }
}
