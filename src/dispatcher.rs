//! # Dispatcher
//!
//! Top-level lifecycle owner. The dispatcher is constructed with every
//! collaborator it needs (configuration, provider, monitoring sink), verifies
//! the configured queues, composes one pipeline per queue and starts every
//! subscription group. The returned [`DispatcherHandle`] is the single
//! surface for observing and stopping the engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::BusConfiguration;
use crate::consumer::{
    GroupHandle, GroupStats, GroupStatsSnapshot, PollerContext, PollerStats, PollerStatsSnapshot,
    SubscriptionGroup,
};
use crate::error::{BusError, BusResult};
use crate::messaging::MessagingProvider;
use crate::middleware::PipelineBuilder;
use crate::monitoring::{MonitorEvent, MonitoringSink};

pub struct Dispatcher {
    config: Arc<BusConfiguration>,
    provider: Arc<dyn MessagingProvider>,
    monitor: Arc<dyn MonitoringSink>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<BusConfiguration>,
        provider: Arc<dyn MessagingProvider>,
        monitor: Arc<dyn MonitoringSink>,
    ) -> Self {
        Self {
            config,
            provider,
            monitor,
        }
    }

    pub fn config(&self) -> &BusConfiguration {
        &self.config
    }

    /// Verify queues and start every subscription group
    ///
    /// Fails only on startup problems; once running, provider and handler
    /// errors are contained by the pollers and workers. Cancelling `cancel`
    /// (or calling [`DispatcherHandle::stop`]) shuts everything down.
    #[instrument(skip_all, fields(provider = self.provider.provider_name()))]
    pub async fn start(&self, cancel: CancellationToken) -> BusResult<DispatcherHandle> {
        let queue_names = self.config.queue_names();
        let report = self.provider.verify_queues(&queue_names).await?;
        if !report.is_healthy() {
            let mut queues = report.missing;
            queues.extend(report.errors.into_iter().map(|(queue, _)| queue));
            return Err(BusError::MissingQueues { queues });
        }

        let token = cancel.child_token();
        let handler_timeout = self.config.handler.timeout();
        let mut groups = Vec::with_capacity(self.config.groups().len());

        for group_config in self.config.groups() {
            let group_name: Arc<str> = Arc::from(group_config.name.as_str());
            let pollers = self
                .config
                .queues_for_group(&group_config.name)
                .map(|queue| {
                    let pipeline =
                        PipelineBuilder::new(self.config.handlers_for(queue), Arc::clone(&self.monitor))
                            .stages(group_config.middleware.iter().cloned())
                            .stages(queue.middleware.iter().cloned())
                            .handler_timeout(handler_timeout)
                            .build();

                    PollerContext {
                        queue: queue.clone(),
                        group_name: Arc::clone(&group_name),
                        pipeline,
                        backoff: self.config.backoff_for(queue),
                        provider: Arc::clone(&self.provider),
                        monitor: Arc::clone(&self.monitor),
                        settings: self.config.poller.clone(),
                        retry: self.config.provider_retry.clone(),
                    }
                })
                .collect();

            groups.push(SubscriptionGroup::new(group_config.clone(), pollers).start(token.clone()));
        }

        let idle_reporter = self
            .config
            .monitoring
            .idle_reporting_enabled
            .then(|| self.spawn_idle_reporter(&groups, token.clone()));

        info!(
            groups = groups.len(),
            queues = queue_names.len(),
            "🚀 Dispatcher started"
        );

        Ok(DispatcherHandle {
            token,
            groups,
            idle_reporter,
            grace_period: self.config.shutdown.grace_period(),
        })
    }

    /// Report `Idle` each time every queue goes from busy to empty with nothing in flight
    fn spawn_idle_reporter(&self, groups: &[GroupHandle], cancel: CancellationToken) -> JoinHandle<()> {
        let pollers: Vec<Arc<PollerStats>> = groups
            .iter()
            .flat_map(|g| g.poller_stats().iter().cloned())
            .collect();
        let group_stats: Vec<Arc<GroupStats>> = groups.iter().map(|g| g.stats()).collect();
        let group_names: Vec<String> = groups.iter().map(|g| g.name().to_string()).collect();
        let interval = self.config.monitoring.idle_check_interval();
        let monitor = Arc::clone(&self.monitor);

        tokio::spawn(async move {
            let mut was_idle = false;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                // Empty receives alone are not enough while handlers still run
                let idle = !pollers.is_empty()
                    && pollers.iter().all(|p| p.is_quiescent())
                    && group_stats.iter().all(|g| {
                        let snapshot = g.snapshot();
                        snapshot.in_flight == 0 && snapshot.buffered == 0
                    });
                if idle && !was_idle {
                    monitor.record(&MonitorEvent::Idle {
                        groups: group_names.clone(),
                    });
                }
                was_idle = idle;
            }
        })
    }
}

/// How the engine stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// False when the grace period ran out and tasks were aborted
    pub graceful: bool,
    pub elapsed: Duration,
    pub panicked_tasks: usize,
}

/// Handle to a running dispatcher
pub struct DispatcherHandle {
    token: CancellationToken,
    groups: Vec<GroupHandle>,
    idle_reporter: Option<JoinHandle<()>>,
    grace_period: Option<Duration>,
}

impl DispatcherHandle {
    /// Token that stops every group and poller when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn group_stats(&self) -> Vec<GroupStatsSnapshot> {
        self.groups.iter().map(|g| g.stats().snapshot()).collect()
    }

    pub fn poller_stats(&self) -> Vec<PollerStatsSnapshot> {
        self.groups
            .iter()
            .flat_map(|g| g.poller_stats().iter().map(|p| p.snapshot()))
            .collect()
    }

    /// Wait for an external cancellation, then drain
    pub async fn wait(self) -> ShutdownReport {
        self.token.cancelled().await;
        self.drain().await
    }

    /// Cancel and drain
    ///
    /// In-flight handlers finish and their messages are settled. With a
    /// grace period configured, whatever is still running when it elapses
    /// is aborted and the report is marked not graceful.
    pub async fn stop(self) -> ShutdownReport {
        info!("🛑 Dispatcher stopping");
        self.token.cancel();
        self.drain().await
    }

    async fn drain(mut self) -> ShutdownReport {
        let started = Instant::now();

        let drained = {
            let joins = futures::future::join_all(self.groups.iter_mut().map(|g| g.join()));
            match self.grace_period {
                Some(grace) => tokio::time::timeout(grace, joins).await.ok(),
                None => Some(joins.await),
            }
        };

        let (graceful, panicked_tasks) = match drained {
            Some(panics) => (true, panics.into_iter().sum()),
            None => {
                warn!(
                    grace_period_ms = self.grace_period.map(|g| g.as_millis() as u64),
                    "⏰ Grace period elapsed, aborting remaining tasks"
                );
                for group in &mut self.groups {
                    group.abort().await;
                }
                (false, 0)
            }
        };

        if let Some(reporter) = self.idle_reporter.take() {
            let _ = reporter.await;
        }

        let report = ShutdownReport {
            graceful,
            elapsed: started.elapsed(),
            panicked_tasks,
        };
        info!(
            graceful = report.graceful,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "✅ Dispatcher stopped"
        );
        report
    }
}
