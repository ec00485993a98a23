use proptest::prelude::*;

use subscription_bus::backoff::{BackoffConfig, ProviderRetryPolicy};

/// Strategy for jitter-free backoff configurations
pub fn deterministic_backoff_strategy() -> impl Strategy<Value = BackoffConfig> {
    (1u64..=5_000, 1u64..=3_600_000, 0u32..=20, any::<bool>()).prop_map(
        |(base_delay_ms, max_delay_ms, retry_ceiling, honor_handler_override)| BackoffConfig {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            retry_ceiling,
            jitter_enabled: false,
            jitter_max_percentage: 0.0,
            honor_handler_override,
        },
    )
}

/// Strategy for backoff configurations with jitter turned on
pub fn jittered_backoff_strategy() -> impl Strategy<Value = BackoffConfig> {
    (deterministic_backoff_strategy(), 0.0f64..=1.0).prop_map(|(config, jitter)| BackoffConfig {
        jitter_enabled: true,
        jitter_max_percentage: jitter,
        ..config
    })
}

/// Strategy for provider retry policies
pub fn provider_retry_strategy() -> impl Strategy<Value = ProviderRetryPolicy> {
    (1u64..=1_000, 1u64..=60_000, 1.0f64..=4.0, 1u32..=10).prop_map(
        |(initial_delay_ms, max_delay_ms, multiplier, max_attempts)| ProviderRetryPolicy {
            initial_delay_ms,
            max_delay_ms: max_delay_ms.max(initial_delay_ms),
            multiplier,
            max_attempts,
        },
    )
}

/// Strategy for attempt numbers, including far past any realistic ceiling
pub fn attempt_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![1u32..=30, 30u32..=u32::MAX]
}
