//! Retry backoff for failed projection applies.

use std::time::Duration;

/// Upper bound on the delay between attempts.
pub const OUTBOX_MAX_BACKOFF: Duration = Duration::from_secs(300);

const INITIAL_BACKOFF_SECS: u64 = 1;

/// Delay before the next attempt after `attempt` failures (1-based).
///
/// Doubles from one second and caps at [`OUTBOX_MAX_BACKOFF`]. Attempts at
/// or below 1 get the initial delay.
#[must_use]
pub fn outbox_retry_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let max_secs = OUTBOX_MAX_BACKOFF.as_secs();
    let secs = 1_u64
        .checked_shl(exponent)
        .map_or(max_secs, |factor| INITIAL_BACKOFF_SECS.saturating_mul(factor));
    Duration::from_secs(secs.min(max_secs))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn doubles_then_caps() {
        assert_eq!(outbox_retry_backoff(0), Duration::from_secs(1));
        assert_eq!(outbox_retry_backoff(1), Duration::from_secs(1));
        assert_eq!(outbox_retry_backoff(2), Duration::from_secs(2));
        assert_eq!(outbox_retry_backoff(3), Duration::from_secs(4));
        assert_eq!(outbox_retry_backoff(9), Duration::from_secs(256));

        // Should cap at the maximum
        assert_eq!(outbox_retry_backoff(10), OUTBOX_MAX_BACKOFF);
        assert_eq!(outbox_retry_backoff(64), OUTBOX_MAX_BACKOFF);
        assert_eq!(outbox_retry_backoff(u32::MAX), OUTBOX_MAX_BACKOFF);
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(attempt in 0u32..1_000) {
            let current = outbox_retry_backoff(attempt);
            let next = outbox_retry_backoff(attempt + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= OUTBOX_MAX_BACKOFF);
            prop_assert!(current >= Duration::from_secs(1));
        }
    }
}
