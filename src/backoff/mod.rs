//! # Backoff
//!
//! Two independent policies:
//!
//! - [`BackoffPolicy`] decides when a failed *message* should be redelivered
//!   and whether it should be dead-lettered instead.
//! - [`ProviderRetryPolicy`] decides how a poller retries a failed *provider
//!   call* (delete, visibility change, dead-letter send).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handlers::HandlerError;

mod retry;

pub use retry::{retry_transient, ProviderRetryPolicy};

/// Provider-imposed upper bound on a visibility timeout (12 hours)
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Redelivery decision for a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffDecision {
    pub delay: Duration,
    pub dead_letter: bool,
}

impl BackoffDecision {
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            delay,
            dead_letter: false,
        }
    }

    pub fn dead_letter() -> Self {
        Self {
            delay: Duration::ZERO,
            dead_letter: true,
        }
    }
}

/// Computes the redelivery delay for a failed message
///
/// `attempt` is 1 on the first delivery. Implementations must be pure
/// functions of their inputs; one policy instance is called concurrently by
/// every poller that uses it.
///
/// Any closure with the right signature is a policy:
///
/// ```rust
/// use std::time::Duration;
/// use subscription_bus::backoff::{BackoffDecision, BackoffPolicy};
/// use subscription_bus::handlers::HandlerError;
///
/// let fixed = |attempt: u32, _err: Option<&HandlerError>| BackoffDecision {
///     delay: Duration::from_secs(10),
///     dead_letter: attempt > 5,
/// };
/// assert!(fixed.compute_delay(6, None).dead_letter);
/// ```
pub trait BackoffPolicy: Send + Sync + 'static {
    fn compute_delay(&self, attempt: u32, last_error: Option<&HandlerError>) -> BackoffDecision;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32, Option<&HandlerError>) -> BackoffDecision + Send + Sync + 'static,
{
    fn compute_delay(&self, attempt: u32, last_error: Option<&HandlerError>) -> BackoffDecision {
        self(attempt, last_error)
    }
}

/// Settings for [`ExponentialBackoff`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Number of retries after the first delivery before dead-lettering
    pub retry_ceiling: u32,
    pub jitter_enabled: bool,
    /// Jitter upper bound as a fraction of the computed delay (0.1 = +10%)
    pub jitter_max_percentage: f64,
    /// Use a handler's `retry_after` in place of the computed delay
    pub honor_handler_override: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 15 * 60 * 1_000,
            retry_ceiling: 5,
            jitter_enabled: true,
            jitter_max_percentage: 0.1,
            honor_handler_override: true,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Configured maximum, clamped to the provider maximum
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms).min(MAX_VISIBILITY_TIMEOUT)
    }
}

/// Default policy: `base * 2^(attempt-1)`, capped, with optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl ExponentialBackoff {
    /// Jitter percentages outside `0.0..=1.0` are clamped; NaN disables jitter
    pub fn new(mut config: BackoffConfig) -> Self {
        config.jitter_max_percentage = if config.jitter_max_percentage.is_nan() {
            0.0
        } else {
            config.jitter_max_percentage.clamp(0.0, 1.0)
        };
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay before jitter for a given attempt
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1_u64 << exponent;
        let base_ms = self.config.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(base_ms).min(self.config.max_delay())
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn compute_delay(&self, attempt: u32, last_error: Option<&HandlerError>) -> BackoffDecision {
        if attempt > self.config.retry_ceiling {
            return BackoffDecision::dead_letter();
        }

        let max = self.config.max_delay();
        let requested = last_error
            .filter(|_| self.config.honor_handler_override)
            .and_then(|e| e.retry_after);
        if let Some(requested) = requested {
            return BackoffDecision::retry_after(requested.min(max));
        }

        let delay = self.base_delay_for(attempt);
        let delay = if self.config.jitter_enabled && self.config.jitter_max_percentage > 0.0 {
            let jitter = fastrand::f64() * self.config.jitter_max_percentage;
            Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + jitter)).unwrap_or(max)
        } else {
            delay
        };

        BackoffDecision::retry_after(delay.min(max))
    }
}
