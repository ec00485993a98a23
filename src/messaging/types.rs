//! # Messaging Types
//!
//! Provider-agnostic message structures. A [`QueueMessage`] is created by a
//! provider on receipt and is immutable afterwards apart from its attempt
//! counter.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::{MessagingError, MessagingResult};

/// Unique identifier for a queued message
///
/// The format is provider-specific; the in-memory provider uses a
/// monotonically increasing integer per queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new message ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Handle for acknowledging or re-timing one receipt of a message
///
/// A new handle is issued every time a message is received, so a handle
/// identifies a receipt rather than a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    /// Create a new receipt handle
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReceiptHandle {
    fn from(handle: String) -> Self {
        Self(handle)
    }
}

impl From<&str> for ReceiptHandle {
    fn from(handle: &str) -> Self {
        Self(handle.to_string())
    }
}

/// Provider metadata attached to a received message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Handle for this receipt
    pub receipt_handle: ReceiptHandle,
    /// Approximate number of times the provider has handed this message out
    pub receive_count: u32,
    /// Queue the message was received from
    pub queue_name: String,
    /// When the message was originally enqueued
    pub enqueued_at: DateTime<Utc>,
    /// When the message was first received by any consumer
    pub first_received_at: Option<DateTime<Utc>>,
    /// FIFO message group; messages sharing a group are processed one at a time
    pub message_group_id: Option<String>,
}

impl MessageMetadata {
    /// Create metadata for a receipt
    pub fn new(
        receipt_handle: ReceiptHandle,
        queue_name: impl Into<String>,
        receive_count: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            receipt_handle,
            receive_count,
            queue_name: queue_name.into(),
            enqueued_at,
            first_received_at: None,
            message_group_id: None,
        }
    }

    /// Set the first receive timestamp
    pub fn with_first_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_received_at = Some(at);
        self
    }

    /// Set the FIFO message group id
    pub fn with_message_group_id(mut self, group_id: Option<String>) -> Self {
        self.message_group_id = group_id;
        self
    }
}

/// A message received from a provider queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    id: MessageId,
    message_type: Option<String>,
    body: String,
    attributes: HashMap<String, String>,
    metadata: MessageMetadata,
    attempt: u32,
}

impl QueueMessage {
    /// Create a received message; called by providers
    pub fn new(id: MessageId, body: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self {
            id,
            message_type: None,
            body: body.into(),
            attributes: HashMap::new(),
            metadata,
            attempt: 0,
        }
    }

    /// Build a received message from what was originally sent
    pub fn from_outbound(id: MessageId, outbound: &OutboundMessage, metadata: MessageMetadata) -> Self {
        Self {
            id,
            message_type: outbound.message_type.clone(),
            body: outbound.body.clone(),
            attributes: outbound.attributes.clone(),
            metadata: metadata.with_message_group_id(outbound.message_group_id.clone()),
            attempt: 0,
        }
    }

    /// Set the message type tag
    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Add a string attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// The type tag used to resolve a handler
    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn receipt_handle(&self) -> &ReceiptHandle {
        &self.metadata.receipt_handle
    }

    pub fn queue_name(&self) -> &str {
        &self.metadata.queue_name
    }

    pub fn group_id(&self) -> Option<&str> {
        self.metadata.message_group_id.as_deref()
    }

    /// Attempt number recorded by the poller (1 on first delivery)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record one more delivery attempt and return the new attempt number
    ///
    /// The attempt never goes backwards: it is the larger of the provider's
    /// receive count and the previous attempt plus one.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempt = self.metadata.receive_count.max(self.attempt + 1);
        self.attempt
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        serde_json::from_str(&self.body).map_err(MessagingError::from)
    }
}

/// A message to be sent to a queue or topic
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub body: String,
    pub message_type: Option<String>,
    pub attributes: HashMap<String, String>,
    pub message_group_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Serialize a value as the JSON body
    pub fn json<T: Serialize>(value: &T) -> MessagingResult<Self> {
        let body = serde_json::to_string(value)
            .map_err(|e| MessagingError::internal(format!("failed to serialize body: {e}")))?;
        Ok(Self::new(body))
    }

    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.message_group_id = Some(group_id.into());
        self
    }
}

impl From<&QueueMessage> for OutboundMessage {
    fn from(message: &QueueMessage) -> Self {
        Self {
            body: message.body.clone(),
            message_type: message.message_type.clone(),
            attributes: message.attributes.clone(),
            message_group_id: message.metadata.message_group_id.clone(),
        }
    }
}

/// Health check result for startup queue verification
#[derive(Debug, Clone, Default)]
pub struct QueueHealthReport {
    /// Queues that exist and are accessible
    pub healthy: Vec<String>,

    /// Queues that don't exist
    pub missing: Vec<String>,

    /// Queues that exist but had errors during verification
    pub errors: Vec<(String, String)>,
}

impl QueueHealthReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if all queues are healthy (none missing or errored)
    pub fn is_healthy(&self) -> bool {
        self.missing.is_empty() && self.errors.is_empty()
    }

    pub fn add_healthy(&mut self, queue_name: impl Into<String>) {
        self.healthy.push(queue_name.into());
    }

    pub fn add_missing(&mut self, queue_name: impl Into<String>) {
        self.missing.push(queue_name.into());
    }

    pub fn add_error(&mut self, queue_name: impl Into<String>, error: impl Into<String>) {
        self.errors.push((queue_name.into(), error.into()));
    }
}
