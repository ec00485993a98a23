//! Retry policy for transient provider errors.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::messaging::MessagingResult;

/// Exponential retry for provider calls that fail transiently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderRetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Total calls per operation, including the first
    pub max_attempts: u32,
}

impl Default for ProviderRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl ProviderRetryPolicy {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Run a provider call, retrying transient failures per `policy`
///
/// Non-transient errors and the error from the last allowed attempt are
/// returned as-is.
pub async fn retry_transient<T, F, Fut>(
    policy: &ProviderRetryPolicy,
    operation: &str,
    mut call: F,
) -> MessagingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MessagingResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(
                    operation = %operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "🔄 Retrying transient provider error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
