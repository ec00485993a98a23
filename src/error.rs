//! Startup and configuration errors.
//!
//! Everything that goes wrong once messages are flowing (provider hiccups,
//! handler failures, poison messages) is contained by the pollers and
//! workers. Only the errors here ever reach the caller.

use thiserror::Error;

use crate::messaging::MessagingError;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Queues missing at startup: {}", .queues.join(", "))]
    MissingQueues { queues: Vec<String> },

    #[error("Queue {queue} references unknown subscription group {group}")]
    UnknownGroup { queue: String, group: String },

    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),
}

impl BusError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn duplicate(kind: &'static str, name: impl Into<String>) -> Self {
        Self::DuplicateName {
            kind,
            name: name.into(),
        }
    }
}

pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_queues_lists_every_queue() {
        let err = BusError::MissingQueues {
            queues: vec!["orders".to_string(), "refunds".to_string()],
        };
        assert_eq!(err.to_string(), "Queues missing at startup: orders, refunds");
    }

    #[test]
    fn test_messaging_error_converts() {
        let err: BusError = MessagingError::queue_not_found("orders").into();
        assert!(matches!(err, BusError::Messaging(_)));
        assert!(err.to_string().contains("orders"));
    }
}
