//! # Subscription Group
//!
//! A fixed pool of workers (one per unit of `max_concurrency`) shared by the
//! pollers of every queue in the group. All pollers feed one bounded
//! `async-channel`, so the group's concurrency ceiling holds across its
//! queues and a full channel pushes back on every poller at once.
//!
//! Each worker additionally owns an ordered slot channel. Pollers of FIFO
//! queues route messages that carry a message group id to a fixed slot,
//! which keeps messages of one group id on one worker. The shared channel
//! and the slots draw on one pool of `channel_capacity` permits, so the
//! group buffers at most `channel_capacity` unprocessed messages in total.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::poller::{PollerContext, PollerStats, QueuePoller};
use super::work::WorkRouter;
use super::worker::{GroupStats, Worker};
use crate::config::SubscriptionGroupConfig;

pub struct SubscriptionGroup {
    config: SubscriptionGroupConfig,
    pollers: Vec<PollerContext>,
}

impl SubscriptionGroup {
    pub(crate) fn new(config: SubscriptionGroupConfig, pollers: Vec<PollerContext>) -> Self {
        Self { config, pollers }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Spawn the workers and pollers
    ///
    /// The group keeps no channel endpoints of its own: once every poller
    /// and worker has exited the channels close and whatever was still
    /// queued is dropped unacknowledged.
    pub fn start(self, cancel: CancellationToken) -> GroupHandle {
        let SubscriptionGroup { config, pollers } = self;
        let group_name: Arc<str> = Arc::from(config.name.as_str());
        let stats = Arc::new(GroupStats::new(&config.name));
        let mut tasks = JoinSet::new();

        let (shared_tx, shared_rx) = async_channel::bounded(config.channel_capacity);

        let mut slot_senders = Vec::with_capacity(config.max_concurrency);
        for id in 0..config.max_concurrency {
            let (slot_tx, slot_rx) = async_channel::bounded(config.channel_capacity);
            slot_senders.push(slot_tx);

            let worker = Worker {
                id,
                group_name: Arc::clone(&group_name),
                shared: shared_rx.clone(),
                slot: slot_rx,
                stats: Arc::clone(&stats),
            };
            tasks.spawn(worker.run(cancel.clone()));
        }
        drop(shared_rx);

        let router = WorkRouter::new(
            shared_tx,
            slot_senders,
            config.channel_capacity,
            Arc::clone(&stats),
        );
        let mut poller_stats = Vec::with_capacity(pollers.len());
        for ctx in pollers {
            let poller = QueuePoller::new(ctx);
            poller_stats.push(poller.stats());
            tasks.spawn(poller.run(router.clone(), cancel.clone()));
        }
        drop(router);

        info!(
            group = %config.name,
            workers = config.max_concurrency,
            channel_capacity = config.channel_capacity,
            pollers = poller_stats.len(),
            "🟢 Subscription group started"
        );

        GroupHandle {
            name: config.name,
            tasks,
            stats,
            poller_stats,
        }
    }
}

/// Running group: owns its worker and poller tasks
pub struct GroupHandle {
    name: String,
    tasks: JoinSet<()>,
    stats: Arc<GroupStats>,
    poller_stats: Vec<Arc<PollerStats>>,
}

impl GroupHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<GroupStats> {
        Arc::clone(&self.stats)
    }

    pub fn poller_stats(&self) -> &[Arc<PollerStats>] {
        &self.poller_stats
    }

    /// Wait for every task to finish; returns how many panicked
    pub async fn join(&mut self) -> usize {
        let mut panicked = 0;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    panicked += 1;
                    error!(group = %self.name, error = %err, "💥 Group task panicked");
                }
            }
        }
        panicked
    }

    /// Abort whatever is still running
    pub async fn abort(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        info!(group = %self.name, "🔴 Subscription group aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{ExponentialBackoff, ProviderRetryPolicy};
    use crate::config::{PollerSettings, QueueDescriptor};
    use crate::handlers::{handler_fn, HandlerRegistry};
    use crate::messaging::{InMemoryProvider, OutboundMessage};
    use crate::middleware::PipelineBuilder;
    use crate::monitoring::NoopMonitor;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    fn queue(name: &str, fifo: bool) -> QueueDescriptor {
        QueueDescriptor {
            name: name.to_string(),
            group_name: "shared".to_string(),
            batch_size: 10,
            wait_time: Duration::ZERO,
            visibility_timeout: Duration::from_secs(30),
            dead_letter_queue: None,
            fifo,
            middleware: Vec::new(),
            backoff: None,
            handlers: None,
        }
    }

    fn context(
        queue: QueueDescriptor,
        provider: Arc<InMemoryProvider>,
        registry: Arc<HandlerRegistry>,
    ) -> PollerContext {
        PollerContext {
            queue,
            group_name: Arc::from("shared"),
            pipeline: PipelineBuilder::new(registry, Arc::new(NoopMonitor)).build(),
            backoff: Arc::new(ExponentialBackoff::default()),
            provider,
            monitor: Arc::new(NoopMonitor),
            settings: PollerSettings {
                idle_delay_initial_ms: 1,
                idle_delay_max_ms: 5,
                ..Default::default()
            },
            retry: ProviderRetryPolicy::default(),
        }
    }

    async fn wait_for_empty(provider: &InMemoryProvider, queues: &[&str]) {
        for _ in 0..200 {
            if queues.iter().all(|q| provider.queue_depth(q) == 0) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queues did not drain");
    }

    #[tokio::test]
    async fn test_one_pool_serves_every_member_queue() {
        let provider = Arc::new(InMemoryProvider::with_queues(&["invoices", "payments"]));
        for queue in ["invoices", "payments"] {
            for _ in 0..5 {
                provider
                    .send(queue, OutboundMessage::new("{}").with_message_type("Billing"))
                    .unwrap();
            }
        }
        let registry = Arc::new(
            HandlerRegistry::new().register("Billing", handler_fn(|_| async { Ok(()) })),
        );

        let group = SubscriptionGroup::new(
            SubscriptionGroupConfig {
                name: "shared".to_string(),
                max_concurrency: 2,
                channel_capacity: 4,
                middleware: Vec::new(),
            },
            vec![
                context(queue("invoices", false), provider.clone(), registry.clone()),
                context(queue("payments", false), provider.clone(), registry),
            ],
        );

        let cancel = CancellationToken::new();
        let mut handle = group.start(cancel.clone());
        wait_for_empty(&provider, &["invoices", "payments"]).await;
        cancel.cancel();
        assert_eq!(handle.join().await, 0);

        let stats = handle.stats().snapshot();
        assert_eq!(stats.succeeded, 10);
        assert!(stats.peak_in_flight <= 2);
        assert_eq!(handle.poller_stats().len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_group_ids_never_overlap() {
        let provider = Arc::new(InMemoryProvider::with_queues(&["ledger"]));
        for customer in ["a", "b", "c"] {
            for seq in 0..4 {
                provider
                    .send(
                        "ledger",
                        OutboundMessage::new(seq.to_string())
                            .with_message_type("Entry")
                            .with_group_id(customer),
                    )
                    .unwrap();
            }
        }

        let active: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let overlaps = Arc::new(Mutex::new(0_usize));
        let (tracked, overlap_count) = (active.clone(), overlaps.clone());
        let registry = Arc::new(HandlerRegistry::new().register(
            "Entry",
            handler_fn(move |message| {
                let active = tracked.clone();
                let overlaps = overlap_count.clone();
                async move {
                    let group = message.group_id().unwrap_or_default().to_string();
                    {
                        let mut active = active.lock();
                        let count = active.entry(group.clone()).or_insert(0);
                        *count += 1;
                        if *count > 1 {
                            *overlaps.lock() += 1;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    *active.lock().entry(group).or_insert(1) -= 1;
                    Ok(())
                }
            }),
        ));

        let group = SubscriptionGroup::new(
            SubscriptionGroupConfig {
                name: "shared".to_string(),
                max_concurrency: 3,
                channel_capacity: 6,
                middleware: Vec::new(),
            },
            vec![context(queue("ledger", true), provider.clone(), registry)],
        );

        let cancel = CancellationToken::new();
        let mut handle = group.start(cancel.clone());
        wait_for_empty(&provider, &["ledger"]).await;
        cancel.cancel();
        handle.join().await;

        assert_eq!(*overlaps.lock(), 0);
        assert_eq!(handle.stats().snapshot().succeeded, 12);
    }

    #[tokio::test]
    async fn test_fifo_and_standard_queues_share_one_capacity() {
        let provider = Arc::new(InMemoryProvider::with_queues(&["ledger", "payments"]));
        for seq in 0..6 {
            provider
                .send(
                    "ledger",
                    OutboundMessage::new(seq.to_string())
                        .with_message_type("Entry")
                        .with_group_id(["a", "b", "c"][seq % 3]),
                )
                .unwrap();
            provider
                .send("payments", OutboundMessage::new("{}").with_message_type("Entry"))
                .unwrap();
        }

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let held = gate.clone();
        let registry = Arc::new(HandlerRegistry::new().register(
            "Entry",
            handler_fn(move |_| {
                let gate = held.clone();
                async move {
                    let _open = gate.acquire().await.unwrap();
                    Ok(())
                }
            }),
        ));

        let group = SubscriptionGroup::new(
            SubscriptionGroupConfig {
                name: "shared".to_string(),
                max_concurrency: 2,
                channel_capacity: 3,
                middleware: Vec::new(),
            },
            vec![
                context(queue("ledger", true), provider.clone(), registry.clone()),
                context(queue("payments", false), provider.clone(), registry),
            ],
        );

        let cancel = CancellationToken::new();
        let mut handle = group.start(cancel.clone());
        let stats = handle.stats();

        for _ in 0..200 {
            if stats.snapshot().buffered == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Both pollers still hold messages waiting for room
        tokio::time::sleep(Duration::from_millis(50)).await;
        let saturated = stats.snapshot();
        assert!(saturated.in_flight >= 1);
        assert_eq!(saturated.buffered, 3);
        assert_eq!(saturated.peak_buffered, 3);

        gate.add_permits(100);
        wait_for_empty(&provider, &["ledger", "payments"]).await;
        cancel.cancel();
        handle.join().await;

        let finished = stats.snapshot();
        assert_eq!(finished.succeeded, 12);
        assert_eq!(finished.buffered, 0);
        assert_eq!(finished.peak_buffered, 3);
    }
}
