//! # Messaging
//!
//! The provider boundary: message types, the [`MessagingProvider`] trait the
//! consumption engine talks to, and an in-memory implementation for tests and
//! local development.

pub mod errors;
pub mod in_memory;
pub mod provider;
pub mod types;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::{InMemoryProvider, InMemoryQueueStats, DEFAULT_DEAD_LETTER_SUFFIX};
pub use provider::MessagingProvider;
pub use types::{
    MessageId, MessageMetadata, OutboundMessage, QueueHealthReport, QueueMessage, ReceiptHandle,
};
