//! Exponential backoff with jitter between upstream attempts.

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `retry` (1 for the first retry).
///
/// A zero `base` disables backoff entirely.
pub fn calculate_backoff(retry: u32, base: Duration, max: Duration) -> Duration {
    if retry == 0 || base.is_zero() {
        return Duration::ZERO;
    }

    let factor = 2u32.saturating_pow(retry - 1);
    let capped = base.saturating_mul(factor).min(max);

    // Up to 10% jitter on top of the capped delay.
    let jitter_ms = (capped.as_millis() / 10) as u64;
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..jitter_ms)
    } else {
        0
    };

    capped + Duration::from_millis(jitter)
}
