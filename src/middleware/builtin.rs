//! Built-in stages: stopwatch, error isolation, handler invocation and the
//! message type filter.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{MessageContext, Middleware, Next};
use crate::handlers::{HandlerError, HandlerRegistry, HandlerResult};
use crate::monitoring::{MonitorEvent, MonitoringSink};

/// Times the inner stages and emits [`MonitorEvent::HandlerInvoked`]
pub struct StopwatchMiddleware {
    monitor: Arc<dyn MonitoringSink>,
}

impl StopwatchMiddleware {
    pub fn new(monitor: Arc<dyn MonitoringSink>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl Middleware for StopwatchMiddleware {
    async fn handle(&self, context: &MessageContext, next: Next<'_>) -> HandlerResult {
        let started = Instant::now();
        let result = next.run(context).await;

        let message = &context.message;
        self.monitor.record(&MonitorEvent::HandlerInvoked {
            queue_name: message.queue_name().to_string(),
            group_name: context.group_name.to_string(),
            message_id: message.id().clone(),
            message_type: message.message_type().map(str::to_string),
            attempt: message.attempt(),
            duration: started.elapsed(),
            outcome: result.outcome(),
        });
        result
    }
}

/// Turns panics and timeouts in the inner stages into a Failure result
///
/// A handler crash never takes its worker down with it.
pub struct ErrorIsolationMiddleware {
    timeout: Option<Duration>,
}

impl ErrorIsolationMiddleware {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl Middleware for ErrorIsolationMiddleware {
    async fn handle(&self, context: &MessageContext, next: Next<'_>) -> HandlerResult {
        let guarded = AssertUnwindSafe(next.run(context)).catch_unwind();

        let caught = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(caught) => caught,
                Err(_) => {
                    warn!(
                        queue = %context.queue_name(),
                        message_id = %context.message.id(),
                        timeout_ms = limit.as_millis() as u64,
                        "⏰ Handler timed out"
                    );
                    return HandlerResult::Failure(HandlerError::timed_out(limit));
                }
            },
            None => guarded.await,
        };

        match caught {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    queue = %context.queue_name(),
                    message_id = %context.message.id(),
                    panic = %message,
                    "💥 Handler panicked"
                );
                HandlerResult::Failure(HandlerError::panicked(message))
            }
        }
    }
}

/// Terminal stage: resolves the handler for the message type and invokes it
pub struct HandlerInvocationMiddleware {
    registry: Arc<HandlerRegistry>,
    monitor: Arc<dyn MonitoringSink>,
}

impl HandlerInvocationMiddleware {
    pub fn new(registry: Arc<HandlerRegistry>, monitor: Arc<dyn MonitoringSink>) -> Self {
        Self { registry, monitor }
    }
}

#[async_trait]
impl Middleware for HandlerInvocationMiddleware {
    async fn handle(&self, context: &MessageContext, _next: Next<'_>) -> HandlerResult {
        let message = &context.message;
        match self.registry.resolve(message.message_type()) {
            Some(handler) => handler.handle(context).await.into(),
            None => {
                self.monitor.record(&MonitorEvent::MessageUnhandled {
                    queue_name: message.queue_name().to_string(),
                    message_id: message.id().clone(),
                    message_type: message.message_type().map(str::to_string),
                });
                HandlerResult::Unhandled
            }
        }
    }
}

/// Acknowledges, without handling, messages whose type is not allow-listed
///
/// Untyped messages are filtered out too. Filtered messages return Success so
/// the poller deletes them.
pub struct MessageTypeFilter {
    allowed: HashSet<String>,
}

impl MessageTypeFilter {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Middleware for MessageTypeFilter {
    async fn handle(&self, context: &MessageContext, next: Next<'_>) -> HandlerResult {
        let allowed = context
            .message
            .message_type()
            .is_some_and(|t| self.allowed.contains(t));

        if allowed {
            next.run(context).await
        } else {
            debug!(
                queue = %context.queue_name(),
                message_id = %context.message.id(),
                message_type = ?context.message.message_type(),
                "🚫 Message type filtered"
            );
            HandlerResult::Success
        }
    }
}
