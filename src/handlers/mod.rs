//! # Message Handlers
//!
//! User callbacks and the registry that maps a message type tag to the
//! callback that processes it. The terminal pipeline stage resolves the
//! handler once per message; a message with no matching handler is reported
//! as [`HandlerResult::Unhandled`] rather than raising an error.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::messaging::{MessagingError, QueueMessage};
use crate::middleware::MessageContext;
use crate::monitoring::Outcome;

/// How a handler execution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// The handler returned an error
    Failed,
    /// The handler panicked; captured by the error isolation stage
    Panicked,
    /// The handler exceeded the configured handler timeout
    TimedOut,
}

impl fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "handler failed"),
            Self::Panicked => write!(f, "handler panicked"),
            Self::TimedOut => write!(f, "handler timed out"),
        }
    }
}

/// Failure reported by (or on behalf of) a message handler
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub message: String,
    pub kind: HandlerErrorKind,
    /// Handler-requested redelivery delay; honoured by the backoff policy when enabled
    pub retry_after: Option<Duration>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: HandlerErrorKind::Failed,
            retry_after: None,
        }
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Panicked,
            ..Self::new(message)
        }
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            kind: HandlerErrorKind::TimedOut,
            ..Self::new(format!("no result after {}ms", timeout.as_millis()))
        }
    }

    /// Ask for the message to be redelivered after `delay`
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<MessagingError> for HandlerError {
    fn from(err: MessagingError) -> Self {
        Self::new(err.to_string())
    }
}

/// Outcome of running the middleware pipeline for one message
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    Success,
    Failure(HandlerError),
    /// No handler is registered for the message type
    Unhandled,
}

impl HandlerResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(HandlerError::new(message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The error carried by a failure
    pub fn error(&self) -> Option<&HandlerError> {
        match self {
            Self::Failure(err) => Some(err),
            _ => None,
        }
    }

    /// Payload-free projection used in monitoring events
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Success => Outcome::Success,
            Self::Failure(_) => Outcome::Failure,
            Self::Unhandled => Outcome::Unhandled,
        }
    }
}

impl From<Result<(), HandlerError>> for HandlerResult {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(err) => Self::Failure(err),
        }
    }
}

/// A user callback that processes one message
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, context: &MessageContext) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure over the received message
pub struct FnHandler<F> {
    func: F,
}

/// Wrap an async closure as a [`MessageHandler`]
///
/// ```rust
/// use subscription_bus::handlers::{handler_fn, HandlerRegistry};
///
/// let registry = HandlerRegistry::new().register(
///     "OrderPlaced",
///     handler_fn(|message| async move {
///         println!("order placed: {}", message.body());
///         Ok(())
///     }),
/// );
/// assert!(registry.resolve(Some("OrderPlaced")).is_some());
/// ```
pub fn handler_fn<F, Fut>(func: F) -> FnHandler<F>
where
    F: Fn(Arc<QueueMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { func }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<QueueMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, context: &MessageContext) -> Result<(), HandlerError> {
        (self.func)(Arc::clone(&context.message)).await
    }
}

/// Handler that decodes the JSON body into `T` before calling the closure
pub struct JsonHandler<T, F> {
    func: F,
    _payload: PhantomData<fn() -> T>,
}

/// Wrap an async closure taking a decoded JSON payload
///
/// A body that fails to decode is a handler failure, so it follows the
/// normal redelivery and dead-letter path.
pub fn json_handler<T, F, Fut>(func: F) -> JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    JsonHandler {
        func,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> MessageHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, context: &MessageContext) -> Result<(), HandlerError> {
        let payload: T = context.message.json()?;
        (self.func)(payload).await
    }
}

/// Mapping from message type tag to handler
///
/// Built once during configuration and shared read-only by every worker.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    default_handler: Option<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a message type, replacing any previous one
    pub fn register(self, message_type: impl Into<String>, handler: impl MessageHandler) -> Self {
        self.register_arc(message_type, Arc::new(handler))
    }

    pub fn register_arc(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handlers.insert(message_type.into(), handler);
        self
    }

    /// Handler used for untyped messages and types with no registration
    pub fn with_default(mut self, handler: impl MessageHandler) -> Self {
        self.default_handler = Some(Arc::new(handler));
        self
    }

    /// Find the handler for a message type; `None` means Unhandled
    pub fn resolve(&self, message_type: Option<&str>) -> Option<Arc<dyn MessageHandler>> {
        message_type
            .and_then(|t| self.handlers.get(t))
            .or(self.default_handler.as_ref())
            .cloned()
    }

    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn has_default(&self) -> bool {
        self.default_handler.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.default_handler.is_none()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.message_types())
            .field("has_default", &self.has_default())
            .finish()
    }
}
