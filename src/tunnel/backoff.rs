//! Reconnect delays
//!
//! Steady-state recovery doubles the delay after every use, capped at the
//! maximum. Startup retries grow linearly and give up after a fixed budget.

use std::time::Duration;

/// Startup retry step and cap
const STARTUP_STEP_MS: u64 = 2000;
const STARTUP_CAP_MS: u64 = 30_000;

/// Wait before startup attempt `attempt + 1`
pub fn startup_delay(attempt: u32) -> Duration {
    Duration::from_millis((STARTUP_STEP_MS * attempt as u64).min(STARTUP_CAP_MS))
}

/// Exponential backoff bookkeeping for the recovery cycle
#[derive(Debug, Clone)]
pub struct BackoffState {
    base: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl BackoffState {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.min(max);
        Self {
            base,
            max,
            current: base,
            attempt: 0,
        }
    }

    /// Delay to use for the next recovery wait: 5s, 10s, 20s, 30s, 30s...
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempt += 1;
        delay
    }

    /// Back to the base delay after the tunnel is Active again
    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempt = 0;
    }

    /// Recovery waits handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_delays_double_up_to_cap() {
        let mut backoff = BackoffState::new(secs(5), secs(30));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, vec![secs(5), secs(10), secs(20), secs(30), secs(30), secs(30)]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_delays_non_decreasing_and_bounded() {
        let mut backoff = BackoffState::new(Duration::from_millis(700), secs(9));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            assert!(delay <= backoff.max_delay());
            last = delay;
        }
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = BackoffState::new(secs(5), secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), secs(5));
    }

    #[test]
    fn test_base_above_max_is_clamped() {
        let mut backoff = BackoffState::new(secs(60), secs(30));
        assert_eq!(backoff.next_delay(), secs(30));
    }

    #[test]
    fn test_startup_delay_is_linear_and_capped() {
        assert_eq!(startup_delay(1), Duration::from_millis(2000));
        assert_eq!(startup_delay(2), Duration::from_millis(4000));
        assert_eq!(startup_delay(20), Duration::from_millis(30_000));
    }
}
