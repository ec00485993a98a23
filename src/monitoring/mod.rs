//! # Monitoring
//!
//! Structured events emitted by the consumption engine. The engine never
//! writes metrics itself; it hands every event to a [`MonitoringSink`] and the
//! sink decides what to do with it (log, count, fan out to subscribers).
//!
//! Sinks are called inline on poller and worker tasks, so `record` must not
//! block.

use std::time::Duration;

use serde::Serialize;

use crate::messaging::MessageId;

mod sinks;

pub use sinks::{
    BroadcastMonitor, CompositeMonitor, CountingMonitor, MonitorSnapshot, NoopMonitor,
    TracingMonitor,
};

/// Payload-free handler outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Unhandled,
}

/// Event emitted by pollers, workers and the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A message was received and its attempt recorded
    MessageReceived {
        queue_name: String,
        group_name: String,
        message_id: MessageId,
        attempt: u32,
    },
    /// The pipeline finished for one message
    HandlerInvoked {
        queue_name: String,
        group_name: String,
        message_id: MessageId,
        message_type: Option<String>,
        attempt: u32,
        duration: Duration,
        outcome: Outcome,
    },
    /// No handler was registered for the message type
    MessageUnhandled {
        queue_name: String,
        message_id: MessageId,
        message_type: Option<String>,
    },
    /// The group channel stayed full past the throttle timeout; the message
    /// was returned to the provider untouched
    Throttled {
        queue_name: String,
        group_name: String,
        message_id: MessageId,
        waited: Duration,
    },
    /// The message exceeded the retry ceiling and was moved to a dead-letter queue
    DeadLettered {
        queue_name: String,
        message_id: MessageId,
        attempt: u32,
        dead_letter_queue: Option<String>,
    },
    /// A provider call failed; the poller keeps running
    PollerError {
        queue_name: String,
        operation: String,
        error: String,
    },
    /// Every poller found its queue empty
    Idle { groups: Vec<String> },
}

impl MonitorEvent {
    /// Stable event name, matching the serialized tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageReceived { .. } => "message_received",
            Self::HandlerInvoked { .. } => "handler_invoked",
            Self::MessageUnhandled { .. } => "message_unhandled",
            Self::Throttled { .. } => "throttled",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::PollerError { .. } => "poller_error",
            Self::Idle { .. } => "idle",
        }
    }

    /// Queue the event relates to, if any
    pub fn queue_name(&self) -> Option<&str> {
        match self {
            Self::MessageReceived { queue_name, .. }
            | Self::HandlerInvoked { queue_name, .. }
            | Self::MessageUnhandled { queue_name, .. }
            | Self::Throttled { queue_name, .. }
            | Self::DeadLettered { queue_name, .. }
            | Self::PollerError { queue_name, .. } => Some(queue_name),
            Self::Idle { .. } => None,
        }
    }
}

/// Receiver of engine events
pub trait MonitoringSink: Send + Sync + 'static {
    fn record(&self, event: &MonitorEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_matches_serialized_tag() {
        let event = MonitorEvent::DeadLettered {
            queue_name: "orders".to_string(),
            message_id: MessageId::from(3_u64),
            attempt: 4,
            dead_letter_queue: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["attempt"], 4);
        assert_eq!(event.queue_name(), Some("orders"));
    }

    #[test]
    fn test_idle_event_has_no_queue() {
        let event = MonitorEvent::Idle {
            groups: vec!["orders".to_string()],
        };
        assert_eq!(event.queue_name(), None);
        assert_eq!(event.name(), "idle");
    }
}
