//! Retry backoff: exponential with jitter, hard-capped.

use rand::Rng;
use std::time::Duration;

/// `min(base * 2^attempt ± 20% jitter, cap)`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.min(20);
    let raw = base
        .as_millis()
        .saturating_mul(1u128 << exponent)
        .min(u64::MAX as u128) as u64;

    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    let jittered = (raw as f64 * jitter) as u64;

    Duration::from_millis(jittered).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(900);

    #[test]
    fn first_attempt_is_near_base() {
        for _ in 0..50 {
            let delay = backoff_delay(BASE, CAP, 0);
            assert!(delay >= Duration::from_secs(4), "too short: {delay:?}");
            assert!(delay <= Duration::from_secs(6), "too long: {delay:?}");
        }
    }

    #[test]
    fn never_exceeds_cap() {
        for attempt in 0..30 {
            assert!(backoff_delay(BASE, CAP, attempt) <= CAP);
        }
    }

    #[test]
    fn grows_exponentially_before_cap() {
        // Compare jitter-free bounds: attempt 3 lower bound (40s * 0.8)
        // clears attempt 1 upper bound (10s * 1.2).
        let low = backoff_delay(BASE, CAP, 1);
        let high = backoff_delay(BASE, CAP, 3);
        assert!(high > low);
    }

    #[test]
    fn large_attempts_do_not_overflow() {
        let delay = backoff_delay(BASE, CAP, u32::MAX);
        assert_eq!(delay, CAP);
    }
}
