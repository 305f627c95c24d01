//! Retry delay schedule: exponential with jitter,
//! `base * 2^(attempt-1) * (1 + rand[0, 0.3))`.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based).
pub fn delay_with_jitter(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exp = base_ms.saturating_mul(1u64 << shift);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.3);
    Duration::from_millis((exp as f64 * (1.0 + jitter)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter_band() {
        for attempt in 1..=5u32 {
            let exp = 100 * (1u64 << (attempt - 1));
            let d = delay_with_jitter(100, attempt);
            assert!(d.as_millis() as u64 >= exp);
            assert!((d.as_millis() as u64) < exp + exp * 3 / 10 + 1);
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = delay_with_jitter(u64::MAX / 2, 40);
        assert!(d.as_millis() > 0);
    }
}
