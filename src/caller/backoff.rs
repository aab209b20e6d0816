//! Full-jitter exponential backoff, as used by every retrying call site
//! in the crate so retry timing stays consistent across providers.

use std::time::Duration;

use rand::Rng;

/// Compute a full-jitter delay for the given zero-indexed `attempt`:
/// `uniform(0, min(max_delay, base_delay * 2^attempt))`.
///
/// Full jitter (rather than a fixed exponential curve) avoids thundering
/// herds when many callers retry the same provider outage at once.
pub fn full_jitter_backoff(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let exponential = base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exponential.min(max_delay);
    if capped.is_zero() {
        return capped;
    }
    let jittered_millis = rand::rng().random_range(0..=capped.as_millis().max(1) as u64);
    Duration::from_millis(jittered_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max_delay() {
        let max_delay = Duration::from_secs(10);
        for attempt in 0..10 {
            let delay = full_jitter_backoff(attempt, Duration::from_millis(200), max_delay);
            assert!(delay <= max_delay);
        }
    }

    #[test]
    fn backoff_grows_with_attempt_on_average() {
        let base = Duration::from_millis(100);
        let max_delay = Duration::from_secs(60);
        let sample = |attempt: u32| -> u128 {
            (0..200)
                .map(|_| full_jitter_backoff(attempt, base, max_delay).as_millis())
                .sum::<u128>()
                / 200
        };
        assert!(sample(5) > sample(0));
    }
}
