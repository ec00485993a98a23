#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Subscription Bus
//!
//! Concurrent message consumption for pub/sub systems built on a queue
//! provider (topics fan out to per-consumer queues).
//!
//! ## Overview
//!
//! Handlers are plain async callbacks keyed by message type. The bus takes
//! care of everything around them: polling every subscribed queue, bounding
//! concurrency per subscription group, running a middleware chain around each
//! handler, isolating handler failures, and deciding when a failed message is
//! redelivered and when it is dead-lettered.
//!
//! ## Architecture
//!
//! - **Queue Poller**: one per queue; receives batches and settles outcomes
//!   (delete, re-time, dead-letter)
//! - **Subscription Group**: a fixed worker pool behind one bounded channel,
//!   shared by the pollers of its queues
//! - **Middleware Pipeline**: user stages around stopwatch, error isolation
//!   and handler invocation
//! - **Backoff Policy**: redelivery delay and dead-letter decision
//! - **Dispatcher**: starts and stops everything behind one cancellation token
//! - **Monitoring Sink**: receives structured engine events
//!
//! ## Module Organization
//!
//! - [`messaging`] - Provider trait, message types, in-memory provider
//! - [`handlers`] - Handler trait, adapters and registry
//! - [`middleware`] - Stage trait, pipeline composition, built-in stages
//! - [`backoff`] - Redelivery and provider retry policies
//! - [`monitoring`] - Events and sinks
//! - [`consumer`] - Pollers, workers and subscription groups
//! - [`config`] - Settings loading and the runtime configuration builder
//! - [`error`] - Startup errors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use subscription_bus::config::BusConfiguration;
//! use subscription_bus::handlers::{handler_fn, HandlerRegistry};
//! use subscription_bus::messaging::InMemoryProvider;
//! use subscription_bus::monitoring::TracingMonitor;
//! use subscription_bus::Dispatcher;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let configuration = BusConfiguration::builder()
//!     .handlers(HandlerRegistry::new().register(
//!         "OrderPlaced",
//!         handler_fn(|message| async move {
//!             println!("order placed: {}", message.body());
//!             Ok(())
//!         }),
//!     ))
//!     .queue("orders", |q| q.dead_letter_queue("orders-dlq"))
//!     .build()?;
//!
//! let provider = Arc::new(InMemoryProvider::with_queues(&["orders"]));
//! let dispatcher = Dispatcher::new(Arc::new(configuration), provider, Arc::new(TracingMonitor));
//! let handle = dispatcher.start(CancellationToken::new()).await?;
//!
//! // ... later
//! let report = handle.stop().await;
//! assert!(report.graceful);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod messaging;
pub mod middleware;
pub mod monitoring;

pub use backoff::{BackoffDecision, BackoffPolicy, ExponentialBackoff, ProviderRetryPolicy};
pub use config::{BusConfiguration, BusConfigurationBuilder, BusSettings, ConfigLoader};
pub use dispatcher::{Dispatcher, DispatcherHandle, ShutdownReport};
pub use error::{BusError, BusResult};
pub use handlers::{HandlerError, HandlerRegistry, HandlerResult, MessageHandler};
pub use messaging::{MessagingError, MessagingProvider, QueueMessage};
pub use middleware::{MessageContext, Middleware, Next, Pipeline};
pub use monitoring::{MonitorEvent, MonitoringSink};
