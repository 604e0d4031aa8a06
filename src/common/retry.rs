//! Retry policy for the streaming supervision loop
//!
//! The supervision loop's continuation decision is an explicit predicate over
//! the attempt counter, not exception-driven control flow: after a stream
//! failure the loop asks [`RetryPolicy::should_retry`] and, when it holds,
//! sleeps [`RetryPolicy::delay_for_attempt`] before restarting the stream.

use std::time::Duration;

/// Bounded retry with exponential backoff and deterministic jitter.
///
/// # Example
///
/// ```rust
/// use auditstream::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::builder()
///     .max_attempts(3)
///     .delay(Duration::from_secs(1))
///     .build();
///
/// assert!(policy.should_retry(2));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum restart attempts before the supervision loop gives up.
    max_attempts: u32,
    /// Base delay before exponential backoff.
    delay: Duration,
    /// Cap on the backed-off delay.
    max_delay: Duration,
    /// Jitter factor (0.0 - 1.0) applied around the capped delay.
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Policy with the given attempt bound and base delay, defaults elsewhere.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..Default::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether another restart is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before restart number `attempt` (0-based), with exponential
    /// backoff capped at `max_delay`. Jitter is derived from the attempt
    /// number (golden ratio sequence) so tests stay reproducible.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay.saturating_mul(2u32.saturating_pow(attempt));
        let capped = base.min(self.max_delay);

        if self.jitter > 0.0 {
            let jitter_range = capped.as_secs_f64() * self.jitter;
            let jitter_offset = (attempt as f64 * 0.618033988749895) % 1.0;
            let jitter_amount = jitter_range * (jitter_offset * 2.0 - 1.0);
            Duration::from_secs_f64((capped.as_secs_f64() + jitter_amount).max(0.0))
        } else {
            capped
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = Some(value);
        self
    }

    pub fn delay(mut self, value: Duration) -> Self {
        self.delay = Some(value);
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            delay: self.delay.unwrap_or(defaults.delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_bound() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert!(!policy.should_retry(0));
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::builder()
            .delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(8))
            .jitter(0.0)
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        // Capped from here on.
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        let policy = RetryPolicy::builder()
            .delay(Duration::from_secs(4))
            .max_delay(Duration::from_secs(4))
            .jitter(0.25)
            .build();

        let a = policy.delay_for_attempt(1);
        let b = policy.delay_for_attempt(1);
        assert_eq!(a, b);

        // Within +/- 25% of the capped 4s delay.
        assert!(a >= Duration::from_secs(3));
        assert!(a <= Duration::from_secs(5));
    }

    #[test]
    fn test_builder_defaults() {
        let policy = RetryPolicy::builder().max_attempts(7).build();
        assert_eq!(policy.max_attempts(), 7);
        assert_eq!(policy.delay(), Duration::from_secs(1));
    }
}
