//! # Middleware Pipeline
//!
//! Per-message processing is an ordered chain of [`Middleware`] stages. Each
//! stage receives the message context and a [`Next`] handle for the rest of
//! the chain, and may run code before and after delegating, short-circuit by
//! not delegating at all, or translate what the inner stages returned.
//!
//! A [`Pipeline`] is composed once per queue at dispatcher start and then
//! shared read-only by every worker of the group. The composed order is:
//!
//! ```text
//! group stages -> queue stages -> stopwatch -> error isolation -> handler invocation
//! ```
//!
//! so user stages execute first on the way in and last on the way out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::handlers::{HandlerRegistry, HandlerResult};
use crate::messaging::QueueMessage;
use crate::monitoring::MonitoringSink;

mod builtin;

pub use builtin::{
    ErrorIsolationMiddleware, HandlerInvocationMiddleware, MessageTypeFilter, StopwatchMiddleware,
};
pub(crate) use builtin::panic_message;

/// What a stage sees for one message
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message: Arc<QueueMessage>,
    pub group_name: Arc<str>,
    /// When the worker picked the message off the group channel
    pub dispatched_at: Instant,
}

impl MessageContext {
    pub fn new(message: Arc<QueueMessage>, group_name: impl Into<Arc<str>>) -> Self {
        Self {
            message,
            group_name: group_name.into(),
            dispatched_at: Instant::now(),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.message.queue_name()
    }

    pub fn attempt(&self) -> u32 {
        self.message.attempt()
    }
}

/// One stage of the processing chain
///
/// Stages are shared across every worker of a group and must be stateless or
/// internally synchronised.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, context: &MessageContext, next: Next<'_>) -> HandlerResult;

    /// Name used in logs and [`Pipeline::stage_names`]
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// The remainder of the chain after the current stage
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Run the remaining stages
    ///
    /// Reaching the end of the chain without a terminal stage yields
    /// [`HandlerResult::Unhandled`].
    pub async fn run(self, context: &MessageContext) -> HandlerResult {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.handle(context, Next { stages: rest }).await,
            None => HandlerResult::Unhandled,
        }
    }
}

/// A composed, immutable middleware chain
///
/// Cloning is a pointer copy.
#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    /// Compose a pipeline directly from stages, without the built-ins
    pub fn from_stages(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    pub async fn handle(&self, context: &MessageContext) -> HandlerResult {
        Next {
            stages: &self.stages,
        }
        .run(context)
        .await
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Assembles user stages around the built-in stages
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Middleware>>,
    registry: Arc<HandlerRegistry>,
    monitor: Arc<dyn MonitoringSink>,
    handler_timeout: Option<Duration>,
}

impl PipelineBuilder {
    pub fn new(registry: Arc<HandlerRegistry>, monitor: Arc<dyn MonitoringSink>) -> Self {
        Self {
            stages: Vec::new(),
            registry,
            monitor,
            handler_timeout: None,
        }
    }

    /// Append a user stage; stages run in the order they are added
    pub fn stage(mut self, stage: impl Middleware) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append already-shared user stages
    pub fn stages<I>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Middleware>>,
    {
        self.stages.extend(stages);
        self
    }

    /// Fail handler executions that run longer than `timeout`
    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn build(self) -> Pipeline {
        let mut stages = self.stages;
        stages.push(Arc::new(StopwatchMiddleware::new(Arc::clone(&self.monitor))));
        stages.push(Arc::new(ErrorIsolationMiddleware::new(self.handler_timeout)));
        stages.push(Arc::new(HandlerInvocationMiddleware::new(
            self.registry,
            self.monitor,
        )));
        Pipeline::from_stages(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{handler_fn, HandlerError};
    use crate::messaging::{MessageId, MessageMetadata, ReceiptHandle};
    use crate::monitoring::{CountingMonitor, NoopMonitor};
    use chrono::Utc;
    use parking_lot::Mutex;

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recording {
        async fn handle(&self, context: &MessageContext, next: Next<'_>) -> HandlerResult {
            self.log.lock().push(format!("{}.before", self.label));
            let result = next.run(context).await;
            self.log.lock().push(format!("{}.after", self.label));
            result
        }
    }

    fn context(message_type: &str) -> MessageContext {
        let message = QueueMessage::new(
            MessageId::from(1_u64),
            "{}",
            MessageMetadata::new(ReceiptHandle::from("1:1"), "orders", 1, Utc::now()),
        )
        .with_message_type(message_type);
        MessageContext::new(Arc::new(message), "orders")
    }

    #[tokio::test]
    async fn test_user_stages_wrap_builtins_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler_log = log.clone();
        let registry = HandlerRegistry::new().register(
            "OrderPlaced",
            handler_fn(move |_| {
                let log = handler_log.clone();
                async move {
                    log.lock().push("handler".to_string());
                    Ok(())
                }
            }),
        );

        let pipeline = PipelineBuilder::new(Arc::new(registry), Arc::new(NoopMonitor))
            .stage(Recording { label: "A", log: log.clone() })
            .stage(Recording { label: "B", log: log.clone() })
            .build();

        let result = pipeline.handle(&context("OrderPlaced")).await;
        assert_eq!(result, HandlerResult::Success);
        assert_eq!(
            *log.lock(),
            vec!["A.before", "B.before", "handler", "B.after", "A.after"]
        );
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "Recording",
                "Recording",
                "StopwatchMiddleware",
                "ErrorIsolationMiddleware",
                "HandlerInvocationMiddleware"
            ]
        );
    }

    #[tokio::test]
    async fn test_unregistered_type_is_unhandled() {
        let monitor = Arc::new(CountingMonitor::new());
        let pipeline = PipelineBuilder::new(Arc::new(HandlerRegistry::new()), monitor.clone()).build();

        let result = pipeline.handle(&context("Unknown")).await;
        assert_eq!(result, HandlerResult::Unhandled);
        assert_eq!(monitor.snapshot().unhandled, 1);
    }

    #[tokio::test]
    async fn test_empty_chain_is_unhandled() {
        let pipeline = Pipeline::from_stages(Vec::new());
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.handle(&context("x")).await, HandlerResult::Unhandled);
    }

    #[tokio::test]
    async fn test_handler_failure_propagates_through_stages() {
        let registry = HandlerRegistry::new().register(
            "OrderPlaced",
            handler_fn(|_| async { Err(HandlerError::new("card declined")) }),
        );
        let pipeline = PipelineBuilder::new(Arc::new(registry), Arc::new(NoopMonitor)).build();

        let result = pipeline.handle(&context("OrderPlaced")).await;
        assert_eq!(result.error().map(|e| e.message.as_str()), Some("card declined"));
    }
}
