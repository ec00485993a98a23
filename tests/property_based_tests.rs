mod common;

use std::time::Duration;

use common::strategies::*;
use proptest::prelude::*;
use subscription_bus::backoff::{BackoffPolicy, ExponentialBackoff, MAX_VISIBILITY_TIMEOUT};
use subscription_bus::handlers::HandlerError;

proptest! {
    /// Property: without jitter the delay never shrinks as attempts grow
    #[test]
    fn backoff_delay_is_non_decreasing(config in deterministic_backoff_strategy(), attempt in 1u32..=40) {
        let policy = ExponentialBackoff::new(config);
        let current = policy.base_delay_for(attempt);
        let next = policy.base_delay_for(attempt + 1);
        prop_assert!(next >= current, "attempt {} gave {:?}, attempt {} gave {:?}", attempt, current, attempt + 1, next);
    }

    /// Property: identical inputs give identical decisions when jitter is off
    #[test]
    fn backoff_is_deterministic_without_jitter(config in deterministic_backoff_strategy(), attempt in attempt_strategy()) {
        let policy = ExponentialBackoff::new(config);
        prop_assert_eq!(policy.compute_delay(attempt, None), policy.compute_delay(attempt, None));
    }

    /// Property: the dead-letter signal flips exactly past the retry ceiling
    #[test]
    fn dead_letter_iff_attempt_exceeds_ceiling(config in deterministic_backoff_strategy(), attempt in attempt_strategy()) {
        let ceiling = config.retry_ceiling;
        let decision = ExponentialBackoff::new(config).compute_delay(attempt, None);
        prop_assert_eq!(decision.dead_letter, attempt > ceiling);
    }

    /// Property: no delay ever exceeds the configured or provider maximum
    #[test]
    fn backoff_delay_respects_caps(config in jittered_backoff_strategy(), attempt in attempt_strategy()) {
        let cap = config.max_delay();
        let decision = ExponentialBackoff::new(config).compute_delay(attempt, None);
        prop_assert!(decision.delay <= cap);
        prop_assert!(decision.delay <= MAX_VISIBILITY_TIMEOUT);
    }

    /// Property: jitter only ever lengthens the delay, by at most the configured fraction
    #[test]
    fn jitter_stays_within_fraction(config in jittered_backoff_strategy(), attempt in 1u32..=20) {
        let policy = ExponentialBackoff::new(config.clone());
        let base = policy.base_delay_for(attempt);
        let decision = policy.compute_delay(attempt, None);
        if !decision.dead_letter {
            let upper = base.mul_f64(1.0 + config.jitter_max_percentage).min(config.max_delay());
            prop_assert!(decision.delay >= base);
            prop_assert!(decision.delay <= upper + Duration::from_millis(1));
        }
    }

    /// Property: a handler's requested delay wins when honoured, clamped to the cap
    #[test]
    fn handler_override_is_clamped(config in deterministic_backoff_strategy(), requested_ms in 0u64..=86_400_000) {
        let honor = config.honor_handler_override;
        let cap = config.max_delay();
        let policy = ExponentialBackoff::new(config);
        let err = HandlerError::new("rate limited").with_retry_after(Duration::from_millis(requested_ms));
        let decision = policy.compute_delay(1, Some(&err));
        if decision.dead_letter {
            return Ok(());
        }
        if honor {
            prop_assert_eq!(decision.delay, Duration::from_millis(requested_ms).min(cap));
        } else {
            prop_assert_eq!(decision.delay, policy.base_delay_for(1));
        }
    }

    /// Property: provider retry delays grow monotonically up to their cap
    #[test]
    fn provider_retry_delay_is_monotonic(policy in provider_retry_strategy(), retry in 1u32..=40) {
        let current = policy.delay_for(retry);
        prop_assert!(policy.delay_for(retry + 1) >= current);
        prop_assert!(current <= policy.max_delay());
    }
}
