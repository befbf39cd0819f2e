//! Exponential backoff for the dispatch worker's retry pause.
//!
//! Capped at `attempts.min(max_attempts)` doublings so a sustained outage
//! still lets the shutdown drain make progress between retries instead of
//! growing the pause without bound.

use std::time::Duration;

pub fn delay(attempts_put: u32, base: Duration, max_attempts: u32) -> Duration {
    let exp = attempts_put.min(max_attempts);
    base * 2u32.saturating_pow(exp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_up_to_the_cap() {
        let base = Duration::from_millis(100);
        assert_eq!(delay(0, base, 5), Duration::from_millis(100));
        assert_eq!(delay(1, base, 5), Duration::from_millis(200));
        assert_eq!(delay(5, base, 5), Duration::from_millis(3200));
    }

    #[test]
    fn clamps_attempts_beyond_the_cap() {
        let base = Duration::from_millis(100);
        assert_eq!(delay(50, base, 5), Duration::from_millis(3200));
    }
}
