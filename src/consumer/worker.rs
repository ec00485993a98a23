//! Group worker loop.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use super::work::{Completion, WorkItem};
use crate::handlers::{HandlerError, HandlerResult};
use crate::middleware::{panic_message, MessageContext};
use crate::monitoring::Outcome;

/// Live counters for one subscription group
#[derive(Debug, Default)]
pub struct GroupStats {
    group_name: String,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    buffered: AtomicUsize,
    peak_buffered: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    unhandled: AtomicU64,
}

/// Point-in-time copy of [`GroupStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStatsSnapshot {
    pub group_name: String,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    /// Items waiting in the group's channels for a worker
    pub buffered: usize,
    pub peak_buffered: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub unhandled: u64,
}

impl GroupStatsSnapshot {
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed + self.unhandled
    }
}

impl GroupStats {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> GroupStatsSnapshot {
        GroupStatsSnapshot {
            group_name: self.group_name.clone(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            buffered: self.buffered.load(Ordering::SeqCst),
            peak_buffered: self.peak_buffered.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn enqueued(&self) {
        let now = self.buffered.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_buffered.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn dequeued(&self) {
        self.buffered.fetch_sub(1, Ordering::SeqCst);
    }

    fn begin(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn end(&self, outcome: Outcome) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let counter = match outcome {
            Outcome::Success => &self.succeeded,
            Outcome::Failure => &self.failed,
            Outcome::Unhandled => &self.unhandled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct Worker {
    pub id: usize,
    pub group_name: Arc<str>,
    pub shared: async_channel::Receiver<WorkItem>,
    /// This worker's ordered channel for FIFO message groups
    pub slot: async_channel::Receiver<WorkItem>,
    pub stats: Arc<GroupStats>,
}

impl Worker {
    /// Process one item at a time until cancelled
    ///
    /// Cancellation is checked before every channel read, so no item is taken
    /// off a channel once shutdown begins. The item being processed is always
    /// finished.
    #[instrument(skip_all, fields(group = %self.group_name, worker = self.id))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut slot_open = true;
        let mut shared_open = true;

        while slot_open || shared_open {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = self.slot.recv(), if slot_open => match item {
                    Ok(item) => item,
                    Err(_) => {
                        slot_open = false;
                        continue;
                    }
                },
                item = self.shared.recv(), if shared_open => match item {
                    Ok(item) => item,
                    Err(_) => {
                        shared_open = false;
                        continue;
                    }
                },
            };

            self.process(item).await;
        }

        debug!("🛑 Worker stopped");
    }

    async fn process(&self, item: WorkItem) {
        let WorkItem {
            message,
            pipeline,
            completion,
            permit,
        } = item;

        // Leaving the channel frees one unit of group capacity
        self.stats.dequeued();
        drop(permit);

        self.stats.begin();
        let context = MessageContext::new(Arc::clone(&message), Arc::clone(&self.group_name));
        // User stages run outside the handler's error isolation
        let result = match AssertUnwindSafe(pipeline.handle(&context)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let panic = panic_message(payload.as_ref());
                error!(
                    queue = %message.queue_name(),
                    message_id = %message.id(),
                    panic = %panic,
                    "💥 Pipeline stage panicked"
                );
                HandlerResult::Failure(HandlerError::panicked(panic))
            }
        };
        self.stats.end(result.outcome());

        // The poller only goes away after its completion channel closes
        let _ = completion.send(Completion { message, result });
    }
}
