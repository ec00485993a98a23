//! Middleware composition through a running dispatcher.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use subscription_bus::handlers::{handler_fn, HandlerError, HandlerRegistry, HandlerResult};
use subscription_bus::messaging::InMemoryProvider;
use subscription_bus::middleware::{MessageContext, MessageTypeFilter, Middleware, Next};
use subscription_bus::monitoring::{MonitorEvent, MonitoringSink};

type Log = Arc<Mutex<Vec<String>>>;

struct Around {
    label: &'static str,
    log: Log,
}

#[async_trait]
impl Middleware for Around {
    async fn handle(&self, context: &MessageContext, next: Next<'_>) -> HandlerResult {
        self.log.lock().push(format!("{}:before", self.label));
        let result = next.run(context).await;
        self.log.lock().push(format!("{}:after", self.label));
        result
    }
}

/// Writes stopwatch timings into the same log as the stages
struct LoggingMonitor {
    log: Log,
}

impl MonitoringSink for LoggingMonitor {
    fn record(&self, event: &MonitorEvent) {
        if let MonitorEvent::HandlerInvoked { .. } = event {
            self.log.lock().push("stopwatch".to_string());
        }
    }
}

/// Turns every failure into a success
struct SwallowFailures;

#[async_trait]
impl Middleware for SwallowFailures {
    async fn handle(&self, context: &MessageContext, next: Next<'_>) -> HandlerResult {
        match next.run(context).await {
            HandlerResult::Failure(_) => HandlerResult::Success,
            other => other,
        }
    }
}

/// Panics before reaching the handler when the body matches
struct PanicsOnBody(&'static str);

#[async_trait]
impl Middleware for PanicsOnBody {
    async fn handle(&self, context: &MessageContext, next: Next<'_>) -> HandlerResult {
        if context.message.body() == self.0 {
            panic!("stage rejected {}", self.0);
        }
        next.run(context).await
    }
}

#[tokio::test]
async fn test_group_stages_wrap_queue_stages_wrap_handler() {
    let provider = Arc::new(InMemoryProvider::with_queues(&["orders"]));
    provider.send("orders", typed("OrderPlaced", "{}")).unwrap();

    let log: Log = Arc::default();
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

    let (group_log, queue_log) = (log.clone(), log.clone());
    let configuration = fast_builder()
        .handlers(registry)
        .group("billing", move |g| {
            g.middleware(Around {
                label: "A",
                log: group_log,
            })
        })
        .queue("orders", move |q| {
            q.group("billing").middleware(Around {
                label: "B",
                log: queue_log,
            })
        })
        .build()
        .unwrap();

    let monitor = Arc::new(LoggingMonitor { log: log.clone() });
    let handle = start(configuration, provider.clone(), monitor).await;
    assert!(wait_until(Duration::from_secs(2), || provider.queue_depth("orders") == 0).await);
    handle.stop().await;

    assert_eq!(
        *log.lock(),
        vec!["A:before", "B:before", "handler", "stopwatch", "B:after", "A:after"]
    );
}

#[tokio::test]
async fn test_queue_filter_acknowledges_without_invoking_handler() {
    let provider = Arc::new(InMemoryProvider::with_queues(&["shipping"]));
    provider.send("shipping", typed("OrderPlaced", "{}")).unwrap();
    provider.send("shipping", typed("InvoiceIssued", "{}")).unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let registry = HandlerRegistry::new().with_default(handler);

    let configuration = fast_builder()
        .handlers(registry)
        .queue("shipping", |q| q.middleware(MessageTypeFilter::new(["OrderPlaced"])))
        .build()
        .unwrap();
    let monitor = RecordingMonitor::new();
    let handle = start(configuration, provider.clone(), monitor.clone()).await;

    assert!(wait_until(Duration::from_secs(2), || provider.queue_depth("shipping") == 0).await);
    handle.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.stats("shipping").unwrap().deleted, 2);
    assert_eq!(monitor.count("handler_invoked"), 1);
}

#[tokio::test]
async fn test_stage_can_translate_failure_into_success() {
    let provider = Arc::new(InMemoryProvider::with_queues(&["orders"]));
    provider.send("orders", typed("OrderPlaced", "{}")).unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let registry = HandlerRegistry::new().register(
        "OrderPlaced",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("always fails"))
            }
        }),
    );

    let configuration = fast_builder()
        .handlers(registry)
        .queue("orders", |q| q.middleware(SwallowFailures))
        .build()
        .unwrap();
    let monitor = RecordingMonitor::new();
    let handle = start(configuration, provider.clone(), monitor.clone()).await;

    assert!(wait_until(Duration::from_secs(2), || provider.queue_depth("orders") == 0).await);
    handle.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.count("dead_lettered"), 0);
    assert!(provider.messages("orders_error").is_empty());
}

#[tokio::test]
async fn test_handler_timeout_counts_as_failure() {
    let provider = Arc::new(InMemoryProvider::with_queues(&["orders"]));
    provider.send("orders", typed("OrderPlaced", "{}")).unwrap();

    let registry = HandlerRegistry::new().register(
        "OrderPlaced",
        handler_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }),
    );

    let configuration = fast_builder()
        .handlers(registry)
        .handler_timeout(Some(Duration::from_millis(20)))
        .queue("orders", |q| q)
        .build()
        .unwrap();
    let monitor = RecordingMonitor::new();
    let handle = start(configuration, provider.clone(), monitor.clone()).await;

    assert!(wait_until(Duration::from_secs(5), || monitor.count("dead_lettered") == 1).await);
    handle.stop().await;

    assert_eq!(provider.messages("orders_error").len(), 1);
}

#[tokio::test]
async fn test_panicking_stage_does_not_cost_the_group_its_worker() {
    let provider = Arc::new(InMemoryProvider::with_queues(&["orders"]));
    provider.send("orders", typed("OrderPlaced", "bad")).unwrap();
    provider.send("orders", typed("OrderPlaced", "good")).unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let registry = HandlerRegistry::new().register(
        "OrderPlaced",
        handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    );

    let configuration = fast_builder()
        .handlers(registry)
        .group("serial", |g| g.max_concurrency(1).middleware(PanicsOnBody("bad")))
        .queue("orders", |q| q.group("serial").batch_size(1))
        .build()
        .unwrap();
    let monitor = RecordingMonitor::new();
    let handle = start(configuration, provider.clone(), monitor.clone()).await;

    assert!(wait_until(Duration::from_secs(3), || provider.queue_depth("orders") == 0).await);
    let group = handle.group_stats().remove(0);
    let report = handle.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.panicked_tasks, 0);
    assert_eq!(group.succeeded, 1);
    assert_eq!(group.failed, 4);
    assert_eq!(monitor.count("dead_lettered"), 1);
    assert_eq!(provider.messages("orders_error")[0].body, "bad");
}
