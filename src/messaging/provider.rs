//! # Messaging Provider Trait
//!
//! The boundary between the consumption engine and a concrete queue backend
//! (SQS, an in-memory double, ...). Every call is a fallible remote call; the
//! engine wraps the acknowledgement calls in its own transient-error retry.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::MessagingResult;
use super::types::{QueueHealthReport, QueueMessage, ReceiptHandle};

/// Provider-agnostic queue operations used by the consumption engine
///
/// Implementations must be safe to call concurrently from every poller in
/// the process; the engine shares one provider instance behind an `Arc`.
#[async_trait]
pub trait MessagingProvider: Send + Sync + 'static {
    /// Receive up to `max_messages` messages
    ///
    /// Waits up to `wait_time` for at least one message to become available
    /// (long polling). Received messages are hidden from other consumers for
    /// `visibility_timeout`.
    async fn receive_messages(
        &self,
        queue_name: &str,
        max_messages: usize,
        wait_time: Duration,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<QueueMessage>>;

    /// Remove a message after successful handling
    async fn delete_message(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
    ) -> MessagingResult<()>;

    /// Make a received message visible again after `delay`
    async fn change_visibility(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        delay: Duration,
    ) -> MessagingResult<()>;

    /// Forward a message to its dead-letter queue
    ///
    /// `dead_letter_queue` is the explicitly configured target; when `None`
    /// the provider applies its default redrive destination. The engine
    /// deletes the source message after this call succeeds.
    async fn send_to_dead_letter(
        &self,
        queue_name: &str,
        dead_letter_queue: Option<&str>,
        message: &QueueMessage,
    ) -> MessagingResult<()>;

    /// Verify that the given queues exist (startup check)
    async fn verify_queues(&self, queue_names: &[String]) -> MessagingResult<QueueHealthReport>;

    /// Whether [`change_visibility`](Self::change_visibility) is honoured
    ///
    /// When false, failed messages are simply left to reappear once the
    /// visibility timeout they were received with lapses.
    fn supports_visibility_change(&self) -> bool {
        true
    }

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}
