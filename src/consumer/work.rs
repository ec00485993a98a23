//! Items moving between pollers and workers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use super::worker::GroupStats;
use crate::handlers::HandlerResult;
use crate::messaging::QueueMessage;
use crate::middleware::Pipeline;

/// A received message on its way to a worker
pub(crate) struct WorkItem {
    pub message: Arc<QueueMessage>,
    /// Pipeline of the queue the message came from
    pub pipeline: Pipeline,
    /// Back channel to the owning poller's settlement loop
    pub completion: mpsc::UnboundedSender<Completion>,
    /// One unit of group channel capacity, held until a worker takes the item
    pub permit: Option<OwnedSemaphorePermit>,
}

impl WorkItem {
    pub fn new(
        message: Arc<QueueMessage>,
        pipeline: Pipeline,
        completion: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        Self {
            message,
            pipeline,
            completion,
            permit: None,
        }
    }
}

/// A worker's verdict on one message
pub(crate) struct Completion {
    pub message: Arc<QueueMessage>,
    pub result: HandlerResult,
}

/// Every receiving worker is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChannelClosed;

/// Sending side of a group's channels, cloned into every poller of the group
///
/// The shared channel and the worker slots draw on one pool of
/// `channel_capacity` permits, so the group never buffers more than its
/// capacity no matter how messages are routed.
#[derive(Clone)]
pub(crate) struct WorkRouter {
    shared: async_channel::Sender<WorkItem>,
    /// One ordered channel per worker, for FIFO message groups
    slots: Arc<[async_channel::Sender<WorkItem>]>,
    capacity: Arc<Semaphore>,
    stats: Arc<GroupStats>,
}

impl WorkRouter {
    pub fn new(
        shared: async_channel::Sender<WorkItem>,
        slots: Vec<async_channel::Sender<WorkItem>>,
        capacity: usize,
        stats: Arc<GroupStats>,
    ) -> Self {
        Self {
            shared,
            slots: slots.into(),
            capacity: Arc::new(Semaphore::new(capacity)),
            stats,
        }
    }

    /// Hand an item to the group, waiting while the group is at capacity
    pub async fn send(&self, mut item: WorkItem, fifo: bool) -> Result<(), ChannelClosed> {
        let permit = Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| ChannelClosed)?;
        item.permit = Some(permit);

        let sender = self.route(&item.message, fifo);
        self.stats.enqueued();
        if sender.send(item).await.is_err() {
            self.stats.dequeued();
            return Err(ChannelClosed);
        }
        Ok(())
    }

    /// Channel for a message
    ///
    /// With `fifo` set, messages carrying a message group id always land on
    /// the same worker's slot channel, so a group id is never processed by
    /// two workers at once.
    pub fn route(&self, message: &QueueMessage, fifo: bool) -> &async_channel::Sender<WorkItem> {
        match message.group_id() {
            Some(group_id) if fifo && !self.slots.is_empty() => {
                &self.slots[slot_for(group_id, self.slots.len())]
            }
            _ => &self.shared,
        }
    }
}

fn slot_for(group_id: &str, slots: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    group_id.hash(&mut hasher);
    (hasher.finish() % slots as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_stable_per_group_id() {
        let first = slot_for("customer-17", 4);
        for _ in 0..10 {
            assert_eq!(slot_for("customer-17", 4), first);
        }
        assert!(first < 4);
    }
}
