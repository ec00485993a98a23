//! Shared fixtures for bus integration tests: fast timings, a recording
//! monitor and a polling wait helper.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use subscription_bus::backoff::{BackoffConfig, ExponentialBackoff, ProviderRetryPolicy};
use subscription_bus::config::{BusConfigurationBuilder, DefaultSettings, PollerSettings};
use subscription_bus::messaging::{InMemoryProvider, OutboundMessage};
use subscription_bus::monitoring::{MonitorEvent, MonitoringSink};
use subscription_bus::{BusConfiguration, Dispatcher, DispatcherHandle};

/// Keeps every event it receives
#[derive(Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<MonitorEvent>>,
}

impl RecordingMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl MonitoringSink for RecordingMonitor {
    fn record(&self, event: &MonitorEvent) {
        self.events.lock().push(event.clone());
    }
}

pub fn fast_poller() -> PollerSettings {
    PollerSettings {
        idle_delay_initial_ms: 1,
        idle_delay_max_ms: 10,
        idle_delay_multiplier: 2.0,
        throttle_timeout_ms: 5_000,
    }
}

pub fn fast_retry() -> ProviderRetryPolicy {
    ProviderRetryPolicy {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        max_attempts: 3,
    }
}

/// Near-immediate redelivery, no jitter
pub fn quick_backoff(retry_ceiling: u32) -> ExponentialBackoff {
    ExponentialBackoff::new(BackoffConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        retry_ceiling,
        jitter_enabled: false,
        jitter_max_percentage: 0.0,
        honor_handler_override: true,
    })
}

/// Builder with test-speed timings: no long polling, tight idle delays
pub fn fast_builder() -> BusConfigurationBuilder {
    BusConfiguration::builder()
        .poller(fast_poller())
        .provider_retry(fast_retry())
        .defaults(DefaultSettings {
            wait_time_secs: 0,
            ..Default::default()
        })
        .backoff(quick_backoff(3))
}

pub fn typed(message_type: &str, body: impl Into<String>) -> OutboundMessage {
    OutboundMessage::new(body).with_message_type(message_type)
}

pub async fn start(
    configuration: BusConfiguration,
    provider: Arc<InMemoryProvider>,
    monitor: Arc<dyn MonitoringSink>,
) -> DispatcherHandle {
    Dispatcher::new(Arc::new(configuration), provider, monitor)
        .start(CancellationToken::new())
        .await
        .expect("dispatcher should start")
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
