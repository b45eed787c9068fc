//! Exponential backoff for reconnect attempts.

use std::time::Duration;

/// Exponential backoff with a ceiling.
///
/// Each call to [`next_delay`](Backoff::next_delay) returns the current
/// delay and multiplies it for the following attempt, never exceeding
/// `max`. A successful reconnect calls [`reset`](Backoff::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Creates a backoff starting at `initial` and capped at `max`.
    ///
    /// A multiplier below 1 is treated as 1 (fixed delay).
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            multiplier: multiplier.max(1),
            current: initial,
            attempts: 0,
        }
    }

    /// Returns the delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

impl Default for Backoff {
    /// 1 s doubling up to 60 s.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5), 2);
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_multiplier_is_fixed() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_initial_above_max_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(3), 2);
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }
}
