//! Built-in [`MonitoringSink`] implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{MonitorEvent, MonitoringSink, Outcome};

/// Writes every event to `tracing`; the default sink
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl MonitoringSink for TracingMonitor {
    fn record(&self, event: &MonitorEvent) {
        match event {
            MonitorEvent::MessageReceived {
                queue_name,
                message_id,
                attempt,
                ..
            } => debug!(queue = %queue_name, message_id = %message_id, attempt = attempt, "📥 Message received"),
            MonitorEvent::HandlerInvoked {
                queue_name,
                message_id,
                attempt,
                duration,
                outcome,
                ..
            } => debug!(
                queue = %queue_name,
                message_id = %message_id,
                attempt = attempt,
                duration_ms = duration.as_millis() as u64,
                outcome = ?outcome,
                "⏱️ Handler invoked"
            ),
            MonitorEvent::MessageUnhandled {
                queue_name,
                message_id,
                message_type,
            } => warn!(queue = %queue_name, message_id = %message_id, message_type = ?message_type, "❓ No handler for message type"),
            MonitorEvent::Throttled {
                queue_name,
                message_id,
                waited,
                ..
            } => warn!(queue = %queue_name, message_id = %message_id, waited_ms = waited.as_millis() as u64, "🐢 Group channel full, message returned to provider"),
            MonitorEvent::DeadLettered {
                queue_name,
                message_id,
                attempt,
                dead_letter_queue,
            } => warn!(queue = %queue_name, message_id = %message_id, attempt = attempt, dead_letter_queue = ?dead_letter_queue, "☠️ Message dead-lettered"),
            MonitorEvent::PollerError {
                queue_name,
                operation,
                error,
            } => warn!(queue = %queue_name, operation = %operation, error = %error, "🔴 Provider call failed"),
            MonitorEvent::Idle { groups } => info!(groups = ?groups, "💤 All queues idle"),
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl MonitoringSink for NoopMonitor {
    fn record(&self, _event: &MonitorEvent) {}
}

/// Forwards every event to each inner sink in order
#[derive(Clone, Default)]
pub struct CompositeMonitor {
    sinks: Vec<Arc<dyn MonitoringSink>>,
}

impl CompositeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MonitoringSink for CompositeMonitor {
    fn record(&self, event: &MonitorEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Fans events out over a `tokio::sync::broadcast` channel
///
/// Publishing with no subscribers is not an error. Slow subscribers lag and
/// lose the oldest events rather than blocking the engine.
///
/// ```rust
/// use subscription_bus::monitoring::{BroadcastMonitor, MonitorEvent, MonitoringSink};
///
/// # tokio_test::block_on(async {
/// let monitor = BroadcastMonitor::default();
/// let mut events = monitor.subscribe();
///
/// monitor.record(&MonitorEvent::Idle { groups: vec!["billing".to_string()] });
/// assert_eq!(events.recv().await.unwrap().name(), "idle");
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct BroadcastMonitor {
    sender: broadcast::Sender<MonitorEvent>,
}

impl BroadcastMonitor {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastMonitor {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MonitoringSink for BroadcastMonitor {
    fn record(&self, event: &MonitorEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event.clone());
    }
}

/// Point-in-time copy of a [`CountingMonitor`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unhandled: u64,
    pub throttled: u64,
    pub dead_lettered: u64,
    pub poller_errors: u64,
    pub idle_reports: u64,
    pub handled_by_queue: HashMap<String, u64>,
}

/// Counts events by kind
#[derive(Debug, Default)]
pub struct CountingMonitor {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    unhandled: AtomicU64,
    throttled: AtomicU64,
    dead_lettered: AtomicU64,
    poller_errors: AtomicU64,
    idle_reports: AtomicU64,
    handled_by_queue: Mutex<HashMap<String, u64>>,
}

impl CountingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            poller_errors: self.poller_errors.load(Ordering::Relaxed),
            idle_reports: self.idle_reports.load(Ordering::Relaxed),
            handled_by_queue: self.handled_by_queue.lock().clone(),
        }
    }
}

impl MonitoringSink for CountingMonitor {
    fn record(&self, event: &MonitorEvent) {
        let counter = match event {
            MonitorEvent::MessageReceived { .. } => &self.received,
            MonitorEvent::HandlerInvoked {
                queue_name,
                outcome,
                ..
            } => {
                *self
                    .handled_by_queue
                    .lock()
                    .entry(queue_name.clone())
                    .or_insert(0) += 1;
                match outcome {
                    Outcome::Success => &self.succeeded,
                    Outcome::Failure | Outcome::Unhandled => &self.failed,
                }
            }
            MonitorEvent::MessageUnhandled { .. } => &self.unhandled,
            MonitorEvent::Throttled { .. } => &self.throttled,
            MonitorEvent::DeadLettered { .. } => &self.dead_lettered,
            MonitorEvent::PollerError { .. } => &self.poller_errors,
            MonitorEvent::Idle { .. } => &self.idle_reports,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
