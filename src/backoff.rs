/// Exponential backoff policy for scheduling redeliveries.
///
/// Delays are lower bounds, not deadlines: the broker holds the retry
/// message for *at least* the computed delay before it re-enters the
/// delivery queue.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 1_800_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay in milliseconds before the retry that follows the given
    /// 1-based attempt: `min(base * 2^(attempt-1), max)`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        // Exponent clamped so absurd attempt counters cannot overflow the shift.
        let exp = attempt.saturating_sub(1).min(30);
        self.base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(1), 5_000);
        assert_eq!(policy.delay_ms(2), 10_000);
        assert_eq!(policy.delay_ms(3), 20_000);
        assert_eq!(policy.delay_ms(4), 40_000);
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(0), policy.delay_ms(1));
    }

    #[test]
    fn caps_at_max_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(12), 1_800_000);
        assert_eq!(policy.delay_ms(u32::MAX), 1_800_000);
    }

    #[test]
    fn monotone_up_to_the_cap() {
        let policy = RetryPolicy::new(100, 30_000);
        for attempt in 1..64 {
            assert!(policy.delay_ms(attempt + 1) >= policy.delay_ms(attempt));
            assert!(policy.delay_ms(attempt) <= 30_000);
        }
    }

    #[test]
    fn custom_base() {
        let policy = RetryPolicy::new(100, 1_800_000);
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
    }
}
