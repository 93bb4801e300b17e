//! Exponential backoff arithmetic.

/// Delay before the next delivery attempt: `base * 2^attempt`, capped.
///
/// `attempt` is the number of failures so far, so the first retry waits the
/// base delay. Saturates instead of overflowing for absurd attempt counts.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    // 2^63 already exceeds any sane cap; clamp the shift to stay defined.
    let factor = 1u64 << attempt.min(62);
    base_ms.saturating_mul(factor).min(cap_ms)
}
