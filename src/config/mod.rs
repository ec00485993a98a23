//! # Configuration
//!
//! Two layers:
//!
//! - [`BusSettings`] is plain serde data loaded from TOML files and
//!   environment variables by [`ConfigLoader`].
//! - [`BusConfiguration`] is the finished, immutable runtime configuration the
//!   [`Dispatcher`](crate::Dispatcher) consumes. It is assembled by
//!   [`BusConfigurationBuilder`], usually seeded from loaded settings and then
//!   given handlers, middleware and backoff policies in code.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use subscription_bus::config::{BusConfigurationBuilder, ConfigLoader};
//! use subscription_bus::handlers::{handler_fn, HandlerRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ConfigLoader::from_file("config/bus.toml")?;
//! let configuration = BusConfigurationBuilder::from_settings(&settings)
//!     .handlers(HandlerRegistry::new().register("OrderPlaced", handler_fn(|_| async { Ok(()) })))
//!     .build()?;
//! assert!(!configuration.queues().is_empty());
//! # Ok(())
//! # }
//! ```

pub mod loader;
pub mod runtime;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffConfig, ProviderRetryPolicy};
use crate::error::{BusError, BusResult};

pub use loader::ConfigLoader;
pub use runtime::{
    BusConfiguration, BusConfigurationBuilder, GroupBuilder, QueueBuilder, QueueDescriptor,
    SubscriptionGroupConfig,
};

/// Everything that can be loaded from configuration files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub poller: PollerSettings,
    pub provider_retry: ProviderRetryPolicy,
    pub backoff: BackoffConfig,
    pub handler: HandlerSettings,
    pub shutdown: ShutdownSettings,
    pub monitoring: MonitoringSettings,
    pub defaults: DefaultSettings,
    pub groups: Vec<GroupSettings>,
    pub queues: Vec<QueueSettings>,
}

impl BusSettings {
    /// Check value ranges; cross-references are checked by the builder
    pub fn validate(&self) -> BusResult<()> {
        self.poller.validate()?;
        self.defaults.validate()?;

        if self.provider_retry.max_attempts == 0 {
            return Err(BusError::configuration(
                "provider_retry.max_attempts must be at least 1",
            ));
        }
        if self.provider_retry.multiplier < 1.0 {
            return Err(BusError::configuration(
                "provider_retry.multiplier must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_max_percentage) {
            return Err(BusError::configuration(
                "backoff.jitter_max_percentage must be between 0.0 and 1.0",
            ));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(BusError::configuration(
                "backoff.base_delay_ms must not exceed backoff.max_delay_ms",
            ));
        }
        if self.monitoring.idle_reporting_enabled && self.monitoring.idle_check_interval_ms == 0 {
            return Err(BusError::configuration(
                "monitoring.idle_check_interval_ms must be positive when idle reporting is enabled",
            ));
        }

        for group in &self.groups {
            if group.max_concurrency == Some(0) || group.channel_capacity == Some(0) {
                return Err(BusError::configuration(format!(
                    "group {} must have positive max_concurrency and channel_capacity",
                    group.name
                )));
            }
        }
        for queue in &self.queues {
            if queue.batch_size == Some(0) {
                return Err(BusError::configuration(format!(
                    "queue {} must have a positive batch_size",
                    queue.name
                )));
            }
        }
        Ok(())
    }
}

/// Queue poller loop timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    /// Delay after the first empty receive
    pub idle_delay_initial_ms: u64,
    /// Cap on the idle delay
    pub idle_delay_max_ms: u64,
    pub idle_delay_multiplier: f64,
    /// How long a poller waits on a full group channel before giving the
    /// message back to the provider
    pub throttle_timeout_ms: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            idle_delay_initial_ms: 100,
            idle_delay_max_ms: 5_000,
            idle_delay_multiplier: 2.0,
            throttle_timeout_ms: 5_000,
        }
    }
}

impl PollerSettings {
    pub fn throttle_timeout(&self) -> Duration {
        Duration::from_millis(self.throttle_timeout_ms)
    }

    /// Delay after `consecutive_empty` empty receives in a row (1-based)
    pub fn idle_delay_for(&self, consecutive_empty: u32) -> Duration {
        let exponent = consecutive_empty.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.idle_delay_multiplier.max(1.0).powi(exponent);
        let millis =
            (self.idle_delay_initial_ms as f64 * factor).min(self.idle_delay_max_ms as f64);
        Duration::from_millis(millis as u64)
    }

    fn validate(&self) -> BusResult<()> {
        if self.idle_delay_initial_ms > self.idle_delay_max_ms {
            return Err(BusError::configuration(
                "poller.idle_delay_initial_ms must not exceed poller.idle_delay_max_ms",
            ));
        }
        if self.idle_delay_multiplier < 1.0 {
            return Err(BusError::configuration(
                "poller.idle_delay_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    /// Fail handler executions that run longer than this
    pub timeout_ms: Option<u64>,
}

impl HandlerSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// How long stop waits for in-flight handlers before aborting them;
    /// `None` waits indefinitely
    pub grace_period_ms: Option<u64>,
}

impl ShutdownSettings {
    pub fn grace_period(&self) -> Option<Duration> {
        self.grace_period_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub idle_reporting_enabled: bool,
    pub idle_check_interval_ms: u64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            idle_reporting_enabled: false,
            idle_check_interval_ms: 1_000,
        }
    }
}

impl MonitoringSettings {
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }
}

/// Values used where a group or queue does not set its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultSettings {
    pub max_concurrency: usize,
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub wait_time_secs: u64,
    pub visibility_timeout_secs: u64,
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            channel_capacity: 32,
            batch_size: 10,
            wait_time_secs: 20,
            visibility_timeout_secs: 30,
        }
    }
}

impl DefaultSettings {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    fn validate(&self) -> BusResult<()> {
        if self.max_concurrency == 0 || self.channel_capacity == 0 || self.batch_size == 0 {
            return Err(BusError::configuration(
                "defaults.max_concurrency, channel_capacity and batch_size must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    pub name: String,
    pub max_concurrency: Option<usize>,
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    /// Owning subscription group; defaults to a group named after the queue
    pub group: Option<String>,
    pub batch_size: Option<usize>,
    pub wait_time_secs: Option<u64>,
    pub visibility_timeout_secs: Option<u64>,
    pub dead_letter_queue: Option<String>,
    /// Route messages sharing a message group id to the same worker
    pub fifo: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(BusSettings::default().validate().is_ok());
    }

    #[test]
    fn test_idle_delay_grows_to_cap() {
        let poller = PollerSettings::default();
        assert_eq!(poller.idle_delay_for(1), Duration::from_millis(100));
        assert_eq!(poller.idle_delay_for(2), Duration::from_millis(200));
        assert_eq!(poller.idle_delay_for(50), Duration::from_millis(5_000));
    }

    #[test]
    fn test_validate_rejects_bad_ranges() {
        let mut settings = BusSettings::default();
        settings.backoff.jitter_max_percentage = 1.5;
        assert!(matches!(
            settings.validate(),
            Err(BusError::Configuration(_))
        ));

        let mut settings = BusSettings::default();
        settings.queues.push(QueueSettings {
            name: "orders".to_string(),
            batch_size: Some(0),
            ..Default::default()
        });
        assert!(settings.validate().is_err());

        let mut settings = BusSettings::default();
        settings.provider_retry.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let shutdown = ShutdownSettings {
            grace_period_ms: Some(10_000),
        };
        assert_eq!(shutdown.grace_period(), Some(Duration::from_secs(10)));
        assert_eq!(HandlerSettings::default().timeout(), None);
    }
}
