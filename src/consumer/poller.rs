//! # Queue Poller
//!
//! One poller per subscribed queue. A poller owns every message it receives
//! until the message reaches a terminal outcome, and runs two loops that are
//! joined together:
//!
//! - the **receive loop** pulls batches from the provider, records the
//!   attempt and pushes each message onto the group channel (blocking when
//!   the channel is full, up to the throttle timeout);
//! - the **settlement loop** acts on the outcome reported by the worker:
//!   delete on success, otherwise consult the backoff policy and either
//!   re-time the message or dead-letter it.
//!
//! The settlement loop outlives the receive loop on shutdown so that
//! in-flight handlers still get their messages acknowledged.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::work::{Completion, WorkItem, WorkRouter};
use crate::backoff::{retry_transient, BackoffPolicy, ProviderRetryPolicy};
use crate::config::{PollerSettings, QueueDescriptor};
use crate::handlers::{HandlerError, HandlerResult};
use crate::messaging::{MessagingError, MessagingProvider, QueueMessage};
use crate::middleware::Pipeline;
use crate::monitoring::{MonitorEvent, MonitoringSink};

/// Live counters for one poller
#[derive(Debug, Default)]
pub struct PollerStats {
    queue_name: String,
    received: AtomicU64,
    deleted: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    throttled: AtomicU64,
    errors: AtomicU64,
    idle: AtomicBool,
    /// Handed to the group and not yet settled
    outstanding: AtomicUsize,
}

/// Point-in-time copy of [`PollerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerStatsSnapshot {
    pub queue_name: String,
    pub received: u64,
    pub deleted: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub throttled: u64,
    pub errors: u64,
    pub idle: bool,
    pub outstanding: usize,
}

impl PollerStats {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    /// Whether the last receive came back empty
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// Messages handed to the group that have not reached an outcome yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Idle and nothing left to settle
    pub fn is_quiescent(&self) -> bool {
        self.is_idle() && self.outstanding() == 0
    }

    fn settled(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> PollerStatsSnapshot {
        PollerStatsSnapshot {
            queue_name: self.queue_name.clone(),
            received: self.received.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            idle: self.is_idle(),
            outstanding: self.outstanding(),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a poller needs besides the group's channels
pub(crate) struct PollerContext {
    pub queue: QueueDescriptor,
    pub group_name: Arc<str>,
    pub pipeline: Pipeline,
    pub backoff: Arc<dyn BackoffPolicy>,
    pub provider: Arc<dyn MessagingProvider>,
    pub monitor: Arc<dyn MonitoringSink>,
    pub settings: PollerSettings,
    pub retry: ProviderRetryPolicy,
}

pub(crate) struct QueuePoller {
    ctx: PollerContext,
    stats: Arc<PollerStats>,
}

impl QueuePoller {
    pub fn new(ctx: PollerContext) -> Self {
        let stats = Arc::new(PollerStats::new(&ctx.queue.name));
        Self { ctx, stats }
    }

    pub fn stats(&self) -> Arc<PollerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until cancelled and every owned message is settled
    #[instrument(skip_all, fields(queue = %self.ctx.queue.name, group = %self.ctx.group_name))]
    pub async fn run(self, router: WorkRouter, cancel: CancellationToken) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        info!(
            provider = self.ctx.provider.provider_name(),
            batch_size = self.ctx.queue.batch_size,
            "🚀 Queue poller starting"
        );

        tokio::join!(
            self.receive_loop(router, completion_tx, &cancel),
            self.settle_loop(completion_rx),
        );

        info!("✅ Queue poller stopped");
    }

    async fn receive_loop(
        &self,
        router: WorkRouter,
        completion: mpsc::UnboundedSender<Completion>,
        cancel: &CancellationToken,
    ) {
        let queue = &self.ctx.queue;
        let mut consecutive_empty = 0_u32;
        let mut consecutive_errors = 0_u32;

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.ctx.provider.receive_messages(
                    &queue.name,
                    queue.batch_size,
                    queue.wait_time,
                    queue.visibility_timeout,
                ) => received,
            };

            let pause = match received {
                Ok(messages) if messages.is_empty() => {
                    consecutive_errors = 0;
                    consecutive_empty = consecutive_empty.saturating_add(1);
                    self.stats.idle.store(true, Ordering::Relaxed);
                    Some(self.ctx.settings.idle_delay_for(consecutive_empty))
                }
                Ok(messages) => {
                    consecutive_errors = 0;
                    consecutive_empty = 0;
                    self.stats.idle.store(false, Ordering::Relaxed);
                    if !self.dispatch_batch(messages, &router, &completion, cancel).await {
                        break;
                    }
                    None
                }
                Err(err) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    self.report_error("receive_messages", &err);
                    Some(self.ctx.retry.delay_for(consecutive_errors))
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        debug!("🛑 Receive loop stopped");
    }

    /// Push a batch onto the group channel; false once the loop should stop
    async fn dispatch_batch(
        &self,
        messages: Vec<QueueMessage>,
        router: &WorkRouter,
        completion: &mpsc::UnboundedSender<Completion>,
        cancel: &CancellationToken,
    ) -> bool {
        let throttle_timeout = self.ctx.settings.throttle_timeout();

        for mut message in messages {
            let attempt = message.record_attempt();
            PollerStats::incr(&self.stats.received);
            self.ctx.monitor.record(&MonitorEvent::MessageReceived {
                queue_name: self.ctx.queue.name.clone(),
                group_name: self.ctx.group_name.to_string(),
                message_id: message.id().clone(),
                attempt,
            });

            let message = Arc::new(message);
            let item = WorkItem::new(
                Arc::clone(&message),
                self.ctx.pipeline.clone(),
                completion.clone(),
            );

            // Counted before the send so a fast settlement never sees it missing
            self.stats.outstanding.fetch_add(1, Ordering::SeqCst);
            let sent = tokio::select! {
                biased;
                // Unsent messages are left for the visibility timeout
                _ = cancel.cancelled() => {
                    self.stats.settled();
                    return false;
                }
                sent = tokio::time::timeout(throttle_timeout, router.send(item, self.ctx.queue.fifo)) => sent,
            };

            match sent {
                Ok(Ok(())) => {}
                Ok(Err(_closed)) => {
                    self.stats.settled();
                    warn!("🔴 Group channel closed, stopping receive loop");
                    return false;
                }
                Err(_elapsed) => {
                    self.stats.settled();
                    PollerStats::incr(&self.stats.throttled);
                    self.ctx.monitor.record(&MonitorEvent::Throttled {
                        queue_name: self.ctx.queue.name.clone(),
                        group_name: self.ctx.group_name.to_string(),
                        message_id: message.id().clone(),
                        waited: throttle_timeout,
                    });
                }
            }
        }
        true
    }

    async fn settle_loop(&self, mut completions: mpsc::UnboundedReceiver<Completion>) {
        while let Some(Completion { message, result }) = completions.recv().await {
            match result {
                HandlerResult::Success => self.acknowledge(&message).await,
                HandlerResult::Failure(err) => self.reject(&message, Some(&err)).await,
                HandlerResult::Unhandled => self.reject(&message, None).await,
            }
            self.stats.settled();
        }
        debug!("🛑 Settlement loop stopped");
    }

    async fn acknowledge(&self, message: &QueueMessage) {
        let provider = &self.ctx.provider;
        let queue_name = self.ctx.queue.name.as_str();

        match retry_transient(&self.ctx.retry, "delete_message", || {
            provider.delete_message(queue_name, message.receipt_handle())
        })
        .await
        {
            Ok(()) => PollerStats::incr(&self.stats.deleted),
            Err(err) => self.report_error("delete_message", &err),
        }
    }

    async fn reject(&self, message: &QueueMessage, last_error: Option<&HandlerError>) {
        let decision = self.ctx.backoff.compute_delay(message.attempt(), last_error);
        if decision.dead_letter {
            self.dead_letter(message).await;
            return;
        }

        PollerStats::incr(&self.stats.retried);
        debug!(
            message_id = %message.id(),
            attempt = message.attempt(),
            delay_ms = decision.delay.as_millis() as u64,
            error = ?last_error.map(|e| e.to_string()),
            "🔁 Message will be redelivered"
        );

        if !self.ctx.provider.supports_visibility_change() {
            return;
        }

        let provider = &self.ctx.provider;
        let queue_name = self.ctx.queue.name.as_str();
        if let Err(err) = retry_transient(&self.ctx.retry, "change_visibility", || {
            provider.change_visibility(queue_name, message.receipt_handle(), decision.delay)
        })
        .await
        {
            self.report_error("change_visibility", &err);
        }
    }

    async fn dead_letter(&self, message: &QueueMessage) {
        let provider = &self.ctx.provider;
        let queue_name = self.ctx.queue.name.as_str();
        let target = self.ctx.queue.dead_letter_queue.as_deref();

        // On failure the message stays on the source queue and is
        // dead-lettered again on its next delivery.
        if let Err(err) = retry_transient(&self.ctx.retry, "send_to_dead_letter", || {
            provider.send_to_dead_letter(queue_name, target, message)
        })
        .await
        {
            self.report_error("send_to_dead_letter", &err);
            return;
        }

        if let Err(err) = retry_transient(&self.ctx.retry, "delete_message", || {
            provider.delete_message(queue_name, message.receipt_handle())
        })
        .await
        {
            self.report_error("delete_message", &err);
        }

        PollerStats::incr(&self.stats.dead_lettered);
        self.ctx.monitor.record(&MonitorEvent::DeadLettered {
            queue_name: self.ctx.queue.name.clone(),
            message_id: message.id().clone(),
            attempt: message.attempt(),
            dead_letter_queue: target.map(str::to_string),
        });
    }

    fn report_error(&self, operation: &str, err: &MessagingError) {
        PollerStats::incr(&self.stats.errors);
        self.ctx.monitor.record(&MonitorEvent::PollerError {
            queue_name: self.ctx.queue.name.clone(),
            operation: operation.to_string(),
            error: err.to_string(),
        });
    }
}
