//! Runtime configuration: the finished structure handed to the dispatcher,
//! and the staged builder that produces it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{
    BusSettings, DefaultSettings, HandlerSettings, MonitoringSettings, PollerSettings,
    ShutdownSettings,
};
use crate::backoff::{BackoffPolicy, ExponentialBackoff, ProviderRetryPolicy};
use crate::error::{BusError, BusResult};
use crate::handlers::HandlerRegistry;
use crate::middleware::Middleware;

/// One subscribed queue
#[derive(Clone)]
pub struct QueueDescriptor {
    pub name: String,
    pub group_name: String,
    pub batch_size: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
    /// Explicit dead-letter target; `None` uses the provider's default
    pub dead_letter_queue: Option<String>,
    pub fifo: bool,
    /// Stages added inside the group's stages for this queue only
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub backoff: Option<Arc<dyn BackoffPolicy>>,
    pub handlers: Option<Arc<HandlerRegistry>>,
}

impl fmt::Debug for QueueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDescriptor")
            .field("name", &self.name)
            .field("group_name", &self.group_name)
            .field("batch_size", &self.batch_size)
            .field("wait_time", &self.wait_time)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("dead_letter_queue", &self.dead_letter_queue)
            .field("fifo", &self.fifo)
            .field("middleware", &self.middleware.len())
            .field("custom_backoff", &self.backoff.is_some())
            .field("custom_handlers", &self.handlers.is_some())
            .finish()
    }
}

/// A named worker pool shared by one or more queues
#[derive(Clone)]
pub struct SubscriptionGroupConfig {
    pub name: String,
    pub max_concurrency: usize,
    pub channel_capacity: usize,
    /// Outermost stages for every queue in the group
    pub middleware: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for SubscriptionGroupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGroupConfig")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .field("channel_capacity", &self.channel_capacity)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// Immutable configuration consumed by the dispatcher
#[derive(Clone)]
pub struct BusConfiguration {
    groups: Vec<SubscriptionGroupConfig>,
    queues: Vec<QueueDescriptor>,
    handlers: Arc<HandlerRegistry>,
    backoff: Arc<dyn BackoffPolicy>,
    pub poller: PollerSettings,
    pub provider_retry: ProviderRetryPolicy,
    pub handler: HandlerSettings,
    pub shutdown: ShutdownSettings,
    pub monitoring: MonitoringSettings,
}

impl BusConfiguration {
    pub fn builder() -> BusConfigurationBuilder {
        BusConfigurationBuilder::new()
    }

    pub fn groups(&self) -> &[SubscriptionGroupConfig] {
        &self.groups
    }

    pub fn queues(&self) -> &[QueueDescriptor] {
        &self.queues
    }

    pub fn group(&self, name: &str) -> Option<&SubscriptionGroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn queues_for_group<'a>(&'a self, group_name: &'a str) -> impl Iterator<Item = &'a QueueDescriptor> {
        self.queues.iter().filter(move |q| q.group_name == group_name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }

    /// Handler registry for a queue: its own override or the bus-wide one
    pub fn handlers_for(&self, queue: &QueueDescriptor) -> Arc<HandlerRegistry> {
        queue
            .handlers
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.handlers))
    }

    /// Backoff policy for a queue: its own override or the bus-wide default
    pub fn backoff_for(&self, queue: &QueueDescriptor) -> Arc<dyn BackoffPolicy> {
        queue
            .backoff
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.backoff))
    }
}

impl fmt::Debug for BusConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConfiguration")
            .field("groups", &self.groups)
            .field("queues", &self.queues)
            .field("handlers", &self.handlers)
            .field("poller", &self.poller)
            .field("provider_retry", &self.provider_retry)
            .field("handler", &self.handler)
            .field("shutdown", &self.shutdown)
            .field("monitoring", &self.monitoring)
            .finish()
    }
}

/// Group under construction
pub struct GroupBuilder {
    name: String,
    max_concurrency: Option<usize>,
    channel_capacity: Option<usize>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl GroupBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_concurrency: None,
            channel_capacity: None,
            middleware: Vec::new(),
        }
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = Some(channel_capacity);
        self
    }

    pub fn middleware(mut self, stage: impl Middleware) -> Self {
        self.middleware.push(Arc::new(stage));
        self
    }

    fn build(self, defaults: &DefaultSettings) -> BusResult<SubscriptionGroupConfig> {
        let config = SubscriptionGroupConfig {
            max_concurrency: self.max_concurrency.unwrap_or(defaults.max_concurrency),
            channel_capacity: self.channel_capacity.unwrap_or(defaults.channel_capacity),
            middleware: self.middleware,
            name: self.name,
        };
        if config.max_concurrency == 0 || config.channel_capacity == 0 {
            return Err(BusError::configuration(format!(
                "group {} must have positive max_concurrency and channel_capacity",
                config.name
            )));
        }
        Ok(config)
    }
}

/// Queue under construction
pub struct QueueBuilder {
    name: String,
    group: Option<String>,
    batch_size: Option<usize>,
    wait_time: Option<Duration>,
    visibility_timeout: Option<Duration>,
    dead_letter_queue: Option<String>,
    fifo: bool,
    middleware: Vec<Arc<dyn Middleware>>,
    backoff: Option<Arc<dyn BackoffPolicy>>,
    handlers: Option<Arc<HandlerRegistry>>,
}

impl QueueBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            batch_size: None,
            wait_time: None,
            visibility_timeout: None,
            dead_letter_queue: None,
            fifo: false,
            middleware: Vec::new(),
            backoff: None,
            handlers: None,
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = Some(wait_time);
        self
    }

    pub fn visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = Some(visibility_timeout);
        self
    }

    pub fn dead_letter_queue(mut self, dead_letter_queue: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(dead_letter_queue.into());
        self
    }

    pub fn fifo(mut self, fifo: bool) -> Self {
        self.fifo = fifo;
        self
    }

    pub fn middleware(mut self, stage: impl Middleware) -> Self {
        self.middleware.push(Arc::new(stage));
        self
    }

    pub fn backoff(mut self, policy: impl BackoffPolicy) -> Self {
        self.backoff = Some(Arc::new(policy));
        self
    }

    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.handlers = Some(Arc::new(registry));
        self
    }

    fn build(self, group_name: String, defaults: &DefaultSettings) -> BusResult<QueueDescriptor> {
        let batch_size = self.batch_size.unwrap_or(defaults.batch_size);
        if batch_size == 0 {
            return Err(BusError::configuration(format!(
                "queue {} must have a positive batch_size",
                self.name
            )));
        }
        Ok(QueueDescriptor {
            name: self.name,
            group_name,
            batch_size,
            wait_time: self.wait_time.unwrap_or_else(|| defaults.wait_time()),
            visibility_timeout: self
                .visibility_timeout
                .unwrap_or_else(|| defaults.visibility_timeout()),
            dead_letter_queue: self.dead_letter_queue,
            fifo: self.fifo,
            middleware: self.middleware,
            backoff: self.backoff,
            handlers: self.handlers,
        })
    }
}

/// Staged builder for [`BusConfiguration`]
///
/// ```rust
/// use std::time::Duration;
/// use subscription_bus::config::BusConfiguration;
/// use subscription_bus::handlers::{handler_fn, HandlerRegistry};
///
/// let configuration = BusConfiguration::builder()
///     .handlers(HandlerRegistry::new().register("OrderPlaced", handler_fn(|_| async { Ok(()) })))
///     .group("orders", |g| g.max_concurrency(4).channel_capacity(16))
///     .queue("order-placed", |q| q.group("orders").visibility_timeout(Duration::from_secs(60)))
///     .queue("order-refunds", |q| q.dead_letter_queue("order-refunds-dlq"))
///     .build()
///     .unwrap();
///
/// assert_eq!(configuration.groups().len(), 2);
/// assert_eq!(configuration.queues()[1].group_name, "order-refunds");
/// ```
pub struct BusConfigurationBuilder {
    defaults: DefaultSettings,
    poller: PollerSettings,
    provider_retry: ProviderRetryPolicy,
    handler: HandlerSettings,
    shutdown: ShutdownSettings,
    monitoring: MonitoringSettings,
    backoff: Arc<dyn BackoffPolicy>,
    handlers: Option<Arc<HandlerRegistry>>,
    groups: Vec<GroupBuilder>,
    queues: Vec<QueueBuilder>,
}

impl Default for BusConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConfigurationBuilder {
    pub fn new() -> Self {
        Self {
            defaults: DefaultSettings::default(),
            poller: PollerSettings::default(),
            provider_retry: ProviderRetryPolicy::default(),
            handler: HandlerSettings::default(),
            shutdown: ShutdownSettings::default(),
            monitoring: MonitoringSettings::default(),
            backoff: Arc::new(ExponentialBackoff::default()),
            handlers: None,
            groups: Vec::new(),
            queues: Vec::new(),
        }
    }

    /// Seed every section, group and queue from loaded settings
    pub fn from_settings(settings: &BusSettings) -> Self {
        let mut builder = Self {
            defaults: settings.defaults.clone(),
            poller: settings.poller.clone(),
            provider_retry: settings.provider_retry.clone(),
            handler: settings.handler.clone(),
            shutdown: settings.shutdown.clone(),
            monitoring: settings.monitoring.clone(),
            backoff: Arc::new(ExponentialBackoff::new(settings.backoff.clone())),
            ..Self::new()
        };

        for group in &settings.groups {
            let mut g = GroupBuilder::new(&group.name);
            g.max_concurrency = group.max_concurrency;
            g.channel_capacity = group.channel_capacity;
            builder.groups.push(g);
        }
        for queue in &settings.queues {
            let mut q = QueueBuilder::new(&queue.name);
            q.group = queue.group.clone();
            q.batch_size = queue.batch_size;
            q.wait_time = queue.wait_time_secs.map(Duration::from_secs);
            q.visibility_timeout = queue.visibility_timeout_secs.map(Duration::from_secs);
            q.dead_letter_queue = queue.dead_letter_queue.clone();
            q.fifo = queue.fifo;
            builder.queues.push(q);
        }
        builder
    }

    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.handlers = Some(Arc::new(registry));
        self
    }

    /// Bus-wide backoff policy, replacing the exponential default
    pub fn backoff(mut self, policy: impl BackoffPolicy) -> Self {
        self.backoff = Arc::new(policy);
        self
    }

    pub fn defaults(mut self, defaults: DefaultSettings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn poller(mut self, poller: PollerSettings) -> Self {
        self.poller = poller;
        self
    }

    pub fn provider_retry(mut self, policy: ProviderRetryPolicy) -> Self {
        self.provider_retry = policy;
        self
    }

    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler.timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn shutdown_grace_period(mut self, grace_period: Option<Duration>) -> Self {
        self.shutdown.grace_period_ms = grace_period.map(|g| g.as_millis() as u64);
        self
    }

    pub fn monitoring(mut self, monitoring: MonitoringSettings) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// Declare a group, or refine one already declared (e.g. from settings)
    pub fn group(mut self, name: &str, configure: impl FnOnce(GroupBuilder) -> GroupBuilder) -> Self {
        match self.groups.iter().position(|g| g.name == name) {
            Some(index) => {
                let existing = self.groups.remove(index);
                self.groups.insert(index, configure(existing));
            }
            None => self.groups.push(configure(GroupBuilder::new(name))),
        }
        self
    }

    /// Declare a queue, or refine one already declared (e.g. from settings)
    pub fn queue(mut self, name: &str, configure: impl FnOnce(QueueBuilder) -> QueueBuilder) -> Self {
        match self.queues.iter().position(|q| q.name == name) {
            Some(index) => {
                let existing = self.queues.remove(index);
                self.queues.insert(index, configure(existing));
            }
            None => self.queues.push(configure(QueueBuilder::new(name))),
        }
        self
    }

    pub fn build(self) -> BusResult<BusConfiguration> {
        if self.queues.is_empty() {
            return Err(BusError::configuration("at least one queue is required"));
        }
        if self.handlers.is_none() && self.queues.iter().any(|q| q.handlers.is_none()) {
            return Err(BusError::configuration(
                "a handler registry is required for queues without their own handlers",
            ));
        }

        let mut group_names = HashSet::new();
        for group in &self.groups {
            if !group_names.insert(group.name.clone()) {
                return Err(BusError::duplicate("group", &group.name));
            }
        }

        let mut groups = self
            .groups
            .into_iter()
            .map(|g| g.build(&self.defaults))
            .collect::<BusResult<Vec<_>>>()?;

        let mut queue_names = HashSet::new();
        let mut queues = Vec::with_capacity(self.queues.len());
        for queue in self.queues {
            if !queue_names.insert(queue.name.clone()) {
                return Err(BusError::duplicate("queue", &queue.name));
            }

            // Only declared groups can be joined; implicit ones belong to their queue
            let group_name = match &queue.group {
                Some(group) if group_names.contains(group) => group.clone(),
                Some(group) => {
                    return Err(BusError::UnknownGroup {
                        queue: queue.name.clone(),
                        group: group.clone(),
                    })
                }
                None if group_names.contains(&queue.name) => {
                    return Err(BusError::duplicate("group", &queue.name));
                }
                None => {
                    groups.push(GroupBuilder::new(&queue.name).build(&self.defaults)?);
                    queue.name.clone()
                }
            };
            queues.push(queue.build(group_name, &self.defaults)?);
        }

        groups.retain(|group| {
            let used = queues.iter().any(|q| q.group_name == group.name);
            if !used {
                warn!(group = %group.name, "⚠️ Subscription group has no queues, skipping");
            }
            used
        });

        Ok(BusConfiguration {
            groups,
            queues,
            handlers: self.handlers.unwrap_or_default(),
            backoff: self.backoff,
            poller: self.poller,
            provider_retry: self.provider_retry,
            handler: self.handler,
            shutdown: self.shutdown,
            monitoring: self.monitoring,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffDecision;
    use crate::config::{GroupSettings, QueueSettings};
    use crate::handlers::{handler_fn, HandlerError};
    use crate::middleware::MessageTypeFilter;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new().register("OrderPlaced", handler_fn(|_| async { Ok(()) }))
    }

    #[test]
    fn test_queue_without_group_gets_implicit_group() {
        let config = BusConfiguration::builder()
            .handlers(registry())
            .queue("orders", |q| q)
            .build()
            .unwrap();

        assert_eq!(config.groups().len(), 1);
        let group = config.group("orders").unwrap();
        assert_eq!(group.max_concurrency, DefaultSettings::default().max_concurrency);
        assert_eq!(config.queues_for_group("orders").count(), 1);
    }

    #[test]
    fn test_shared_group_serves_many_queues() {
        let config = BusConfiguration::builder()
            .handlers(registry())
            .group("billing", |g| g.max_concurrency(2).middleware(MessageTypeFilter::new(["OrderPlaced"])))
            .queue("invoices", |q| q.group("billing"))
            .queue("payments", |q| q.group("billing").fifo(true))
            .build()
            .unwrap();

        assert_eq!(config.groups().len(), 1);
        assert_eq!(config.groups()[0].middleware.len(), 1);
        assert_eq!(config.queues_for_group("billing").count(), 2);
        assert!(config.queues()[1].fifo);
    }

    #[test]
    fn test_unknown_group_is_rejected() {
        let err = BusConfiguration::builder()
            .handlers(registry())
            .queue("orders", |q| q.group("missing"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownGroup { .. }));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut settings = BusSettings::default();
        for _ in 0..2 {
            settings.queues.push(QueueSettings {
                name: "orders".to_string(),
                ..Default::default()
            });
        }
        let err = BusConfigurationBuilder::from_settings(&settings)
            .handlers(registry())
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateName { kind: "queue", .. }));
    }

    #[test]
    fn test_missing_registry_is_rejected() {
        let err = BusConfiguration::builder()
            .queue("orders", |q| q)
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::Configuration(_)));

        assert!(BusConfiguration::builder()
            .queue("orders", |q| q.handlers(registry()))
            .build()
            .is_ok());
    }

    #[test]
    fn test_from_settings_then_refine_in_code() {
        let settings = BusSettings {
            groups: vec![GroupSettings {
                name: "orders".to_string(),
                max_concurrency: Some(3),
                channel_capacity: None,
            }],
            queues: vec![QueueSettings {
                name: "order-placed".to_string(),
                group: Some("orders".to_string()),
                visibility_timeout_secs: Some(90),
                ..Default::default()
            }],
            ..Default::default()
        };

        let config = BusConfigurationBuilder::from_settings(&settings)
            .handlers(registry())
            .queue("order-placed", |q| {
                q.backoff(|_attempt: u32, _err: Option<&HandlerError>| BackoffDecision::dead_letter())
            })
            .build()
            .unwrap();

        let queue = &config.queues()[0];
        assert_eq!(queue.visibility_timeout, Duration::from_secs(90));
        assert_eq!(config.group("orders").unwrap().max_concurrency, 3);
        assert!(config.backoff_for(queue).compute_delay(1, None).dead_letter);
    }

    #[test]
    fn test_implicit_group_cannot_shadow_declared_group() {
        let err = BusConfiguration::builder()
            .handlers(registry())
            .group("orders", |g| g.max_concurrency(2))
            .queue("orders", |q| q)
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateName { kind: "group", .. }));

        // Nor can another queue join a queue's implicit group
        let err = BusConfiguration::builder()
            .handlers(registry())
            .queue("orders", |q| q)
            .queue("refunds", |q| q.group("orders"))
            .build()
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownGroup { .. }));
    }

    #[test]
    fn test_sub_second_grace_period_is_kept() {
        let config = BusConfiguration::builder()
            .handlers(registry())
            .shutdown_grace_period(Some(Duration::from_millis(900)))
            .queue("orders", |q| q)
            .build()
            .unwrap();
        assert_eq!(config.shutdown.grace_period(), Some(Duration::from_millis(900)));
    }

    #[test]
    fn test_unused_group_is_dropped() {
        let config = BusConfiguration::builder()
            .handlers(registry())
            .group("idle", |g| g)
            .queue("orders", |q| q)
            .build()
            .unwrap();
        assert!(config.group("idle").is_none());
    }
}
