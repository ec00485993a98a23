//! # Messaging Error Types
//!
//! Structured errors for provider operations. The consumption engine only
//! needs to tell transient failures (retry the call) apart from everything
//! else, see [`MessagingError::is_transient`].

use thiserror::Error;

/// Errors raised by a [`MessagingProvider`](super::MessagingProvider)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Transient provider error during {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("Provider timeout: operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Invalid receipt handle: {handle}")]
    InvalidReceiptHandle { handle: String },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a transient (network/throttling) error
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid receipt handle error
    pub fn invalid_receipt_handle(handle: impl Into<String>) -> Self {
        Self::InvalidReceiptHandle {
            handle: handle.into(),
        }
    }

    /// Create a message not found error
    pub fn message_not_found(message_id: impl Into<String>) -> Self {
        Self::MessageNotFound {
            message_id: message_id.into(),
        }
    }

    /// Create a message deserialization error
    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same provider call may succeed
    ///
    /// Network blips, throttling responses and timeouts are transient. Missing
    /// queues, stale receipt handles and bad payloads are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout { .. } | Self::QueueOperation { .. }
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::message_deserialization(err.to_string())
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
