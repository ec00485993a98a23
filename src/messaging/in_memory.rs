//! # In-Memory Messaging Provider
//!
//! Thread-safe in-memory queues and topics for testing and development.
//!
//! ## Features
//!
//! - **Visibility Timeout**: Messages become invisible after receive, re-visible after timeout
//! - **Receipt Handles**: A handle is only valid for the most recent receipt of a message
//! - **Topics**: Publishing to a topic fans out to every subscribed queue
//! - **Dead Letters**: Dead-lettered messages land in an explicit target or `<queue>_error`
//! - **Failure Injection**: Transient receive/delete failures for resilience tests

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::errors::{MessagingError, MessagingResult};
use super::provider::MessagingProvider;
use super::types::{
    MessageId, MessageMetadata, OutboundMessage, QueueHealthReport, QueueMessage, ReceiptHandle,
};

/// Upper bound on a single long-poll nap; visibility expiry does not notify
const LONG_POLL_TICK: Duration = Duration::from_millis(10);

/// Suffix of the default dead-letter queue
pub const DEFAULT_DEAD_LETTER_SUFFIX: &str = "_error";

/// In-memory message with visibility tracking
#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    outbound: OutboundMessage,
    enqueued_at: DateTime<Utc>,
    first_received_at: Option<DateTime<Utc>>,
    /// When the message becomes visible again (None = visible now)
    visible_at: Option<Instant>,
    receive_count: u32,
}

impl StoredMessage {
    fn receipt_handle(&self) -> ReceiptHandle {
        ReceiptHandle::new(format!("{}:{}", self.id, self.receive_count))
    }
}

/// Per-queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryQueueStats {
    pub sent: u64,
    pub received: u64,
    pub deleted: u64,
    pub dead_lettered: u64,
    pub visibility_changes: u64,
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    messages: VecDeque<StoredMessage>,
    next_id: u64,
    stats: InMemoryQueueStats,
    fail_receives: u32,
    fail_deletes: u32,
}

impl InMemoryQueue {
    fn push(&mut self, outbound: OutboundMessage) -> MessageId {
        self.next_id += 1;
        self.stats.sent += 1;
        self.messages.push_back(StoredMessage {
            id: self.next_id,
            outbound,
            enqueued_at: Utc::now(),
            first_received_at: None,
            visible_at: None,
            receive_count: 0,
        });
        MessageId::from(self.next_id)
    }

    /// Find the message a receipt handle refers to, rejecting stale handles
    fn position_for(&self, receipt_handle: &ReceiptHandle) -> MessagingResult<usize> {
        let (id, receive_count) = parse_receipt_handle(receipt_handle)?;
        let position = self
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| MessagingError::message_not_found(id.to_string()))?;

        if self.messages[position].receive_count != receive_count {
            return Err(MessagingError::invalid_receipt_handle(receipt_handle.as_str()));
        }
        Ok(position)
    }
}

fn parse_receipt_handle(receipt_handle: &ReceiptHandle) -> MessagingResult<(u64, u32)> {
    let invalid = || MessagingError::invalid_receipt_handle(receipt_handle.as_str());
    let (id, count) = receipt_handle.as_str().split_once(':').ok_or_else(invalid)?;
    Ok((
        id.parse().map_err(|_| invalid())?,
        count.parse().map_err(|_| invalid())?,
    ))
}

/// In-memory messaging provider
///
/// # Example
///
/// ```rust
/// use subscription_bus::messaging::{InMemoryProvider, MessagingProvider, OutboundMessage};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = InMemoryProvider::new();
/// provider.create_topic("order-events");
/// provider.subscribe("order-events", "billing");
/// provider.subscribe("order-events", "shipping");
///
/// provider.publish("order-events", OutboundMessage::new("{}").with_message_type("OrderPlaced"))?;
///
/// let messages = provider
///     .receive_messages("billing", 10, Duration::ZERO, Duration::from_secs(30))
///     .await?;
/// assert_eq!(messages.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryProvider {
    queues: DashMap<String, InMemoryQueue>,
    topics: DashMap<String, Vec<String>>,
    arrivals: Notify,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            topics: DashMap::new(),
            arrivals: Notify::new(),
        }
    }

    /// Create with pre-initialized queues
    pub fn with_queues(queue_names: &[&str]) -> Self {
        let provider = Self::new();
        for name in queue_names {
            provider.create_queue(name);
        }
        provider
    }

    /// Create a queue (idempotent)
    pub fn create_queue(&self, queue_name: &str) {
        self.queues.entry(queue_name.to_string()).or_default();
    }

    /// Create a topic (idempotent)
    pub fn create_topic(&self, topic_name: &str) {
        self.topics.entry(topic_name.to_string()).or_default();
    }

    /// Subscribe a queue to a topic, creating both if needed
    pub fn subscribe(&self, topic_name: &str, queue_name: &str) {
        self.create_queue(queue_name);
        let mut subscribers = self.topics.entry(topic_name.to_string()).or_default();
        if !subscribers.iter().any(|q| q == queue_name) {
            subscribers.push(queue_name.to_string());
        }
    }

    /// Send a message directly to a queue
    pub fn send(&self, queue_name: &str, message: OutboundMessage) -> MessagingResult<MessageId> {
        let id = {
            let mut queue = self
                .queues
                .get_mut(queue_name)
                .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
            queue.push(message)
        };
        self.arrivals.notify_waiters();
        Ok(id)
    }

    /// Publish to a topic; one copy per subscribed queue
    pub fn publish(
        &self,
        topic_name: &str,
        message: OutboundMessage,
    ) -> MessagingResult<Vec<MessageId>> {
        let subscribers = self
            .topics
            .get(topic_name)
            .map(|s| s.clone())
            .ok_or_else(|| {
                MessagingError::queue_operation(topic_name, "publish", "topic does not exist")
            })?;

        subscribers
            .iter()
            .map(|queue_name| self.send(queue_name, message.clone()))
            .collect()
    }

    /// Number of messages stored in a queue, visible or not
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Counters for a queue
    pub fn stats(&self, queue_name: &str) -> Option<InMemoryQueueStats> {
        self.queues.get(queue_name).map(|q| q.stats.clone())
    }

    /// Snapshot of the messages stored in a queue (e.g. a dead-letter queue)
    pub fn messages(&self, queue_name: &str) -> Vec<OutboundMessage> {
        self.queues
            .get(queue_name)
            .map(|q| q.messages.iter().map(|m| m.outbound.clone()).collect())
            .unwrap_or_default()
    }

    /// Make the next `count` receives on a queue fail with a transient error
    pub fn fail_next_receives(&self, queue_name: &str, count: u32) {
        if let Some(mut queue) = self.queues.get_mut(queue_name) {
            queue.fail_receives = count;
        }
    }

    /// Make the next `count` deletes on a queue fail with a transient error
    pub fn fail_next_deletes(&self, queue_name: &str, count: u32) {
        if let Some(mut queue) = self.queues.get_mut(queue_name) {
            queue.fail_deletes = count;
        }
    }

    fn take_visible(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<QueueMessage>> {
        let mut entry = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
        let queue = &mut *entry;

        if queue.fail_receives > 0 {
            queue.fail_receives -= 1;
            return Err(MessagingError::transient(
                "receive_messages",
                format!("injected receive failure on {queue_name}"),
            ));
        }

        let now = Instant::now();
        let now_utc = Utc::now();
        let mut received = Vec::new();

        for stored in queue.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if stored.visible_at.is_some_and(|at| at > now) {
                continue;
            }

            stored.visible_at = Some(now + visibility_timeout);
            stored.receive_count += 1;
            let first_received_at = *stored.first_received_at.get_or_insert(now_utc);
            queue.stats.received += 1;

            let metadata = MessageMetadata::new(
                stored.receipt_handle(),
                queue_name,
                stored.receive_count,
                stored.enqueued_at,
            )
            .with_first_received_at(first_received_at);

            received.push(QueueMessage::from_outbound(
                MessageId::from(stored.id),
                &stored.outbound,
                metadata,
            ));
        }

        Ok(received)
    }
}

#[async_trait]
impl MessagingProvider for InMemoryProvider {
    async fn receive_messages(
        &self,
        queue_name: &str,
        max_messages: usize,
        wait_time: Duration,
        visibility_timeout: Duration,
    ) -> MessagingResult<Vec<QueueMessage>> {
        let deadline = Instant::now() + wait_time;

        loop {
            let received = self.take_visible(queue_name, max_messages, visibility_timeout)?;
            let now = Instant::now();
            if !received.is_empty() || now >= deadline {
                return Ok(received);
            }

            let nap = (deadline - now).min(LONG_POLL_TICK);
            tokio::select! {
                _ = self.arrivals.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn delete_message(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
    ) -> MessagingResult<()> {
        let mut queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        if queue.fail_deletes > 0 {
            queue.fail_deletes -= 1;
            return Err(MessagingError::transient(
                "delete_message",
                format!("injected delete failure on {queue_name}"),
            ));
        }

        let position = queue.position_for(receipt_handle)?;
        queue.messages.remove(position);
        queue.stats.deleted += 1;

        debug!(queue = %queue_name, receipt_handle = %receipt_handle, "🗑️ Message deleted");
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        delay: Duration,
    ) -> MessagingResult<()> {
        let mut queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;

        let position = queue.position_for(receipt_handle)?;
        queue.messages[position].visible_at = Some(Instant::now() + delay);
        queue.stats.visibility_changes += 1;
        Ok(())
    }

    async fn send_to_dead_letter(
        &self,
        queue_name: &str,
        dead_letter_queue: Option<&str>,
        message: &QueueMessage,
    ) -> MessagingResult<()> {
        let target = dead_letter_queue
            .map(str::to_string)
            .unwrap_or_else(|| format!("{queue_name}{DEFAULT_DEAD_LETTER_SUFFIX}"));

        // Source and target may share a shard; never hold both guards.
        {
            let mut source = self
                .queues
                .get_mut(queue_name)
                .ok_or_else(|| MessagingError::queue_not_found(queue_name))?;
            source.stats.dead_lettered += 1;
        }

        self.create_queue(&target);
        self.send(&target, OutboundMessage::from(message))?;

        debug!(queue = %queue_name, dead_letter_queue = %target, message_id = %message.id(), "☠️ Message dead-lettered");
        Ok(())
    }

    async fn verify_queues(&self, queue_names: &[String]) -> MessagingResult<QueueHealthReport> {
        let mut report = QueueHealthReport::new();
        for name in queue_names {
            if self.queues.contains_key(name) {
                report.add_healthy(name);
            } else {
                report.add_missing(name);
            }
        }
        Ok(report)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
