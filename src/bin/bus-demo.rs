//! # Subscription Bus Demo
//!
//! Runs the bus against the in-memory provider: an `order-events` topic fans
//! out to every configured queue, a publisher task emits orders, and handlers
//! fail now and then so retries and dead-lettering show up in the logs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use subscription_bus::config::{
    BusConfigurationBuilder, ConfigLoader, DefaultSettings, GroupSettings, MonitoringSettings,
    QueueSettings,
};
use subscription_bus::handlers::{handler_fn, json_handler, HandlerError, HandlerRegistry};
use subscription_bus::logging::init_structured_logging;
use subscription_bus::messaging::{InMemoryProvider, OutboundMessage};
use subscription_bus::middleware::MessageTypeFilter;
use subscription_bus::monitoring::{CompositeMonitor, CountingMonitor, TracingMonitor};
use subscription_bus::{BusSettings, Dispatcher};

const TOPIC: &str = "order-events";

#[derive(Parser)]
#[command(name = "bus-demo")]
#[command(about = "Run the subscription bus against an in-memory provider")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Settings file (TOML); built-in demo settings when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    duration_secs: Option<u64>,

    /// Number of orders to publish
    #[arg(short, long, default_value_t = 20)]
    orders: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u32,
    amount_cents: u64,
}

fn demo_settings() -> BusSettings {
    BusSettings {
        defaults: DefaultSettings {
            wait_time_secs: 1,
            ..Default::default()
        },
        monitoring: MonitoringSettings {
            idle_reporting_enabled: true,
            ..Default::default()
        },
        groups: vec![GroupSettings {
            name: "fulfilment".to_string(),
            max_concurrency: Some(4),
            channel_capacity: Some(16),
        }],
        queues: vec![
            QueueSettings {
                name: "billing".to_string(),
                group: Some("fulfilment".to_string()),
                dead_letter_queue: Some("billing-dlq".to_string()),
                ..Default::default()
            },
            QueueSettings {
                name: "shipping".to_string(),
                group: Some("fulfilment".to_string()),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            "OrderPlaced",
            json_handler(|order: OrderPlaced| async move {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(10..100))).await;
                if order.order_id % 7 == 0 {
                    return Err(HandlerError::new(format!(
                        "payment gateway rejected order {}",
                        order.order_id
                    )));
                }
                info!(order_id = order.order_id, amount_cents = order.amount_cents, "💳 Order processed");
                Ok(())
            }),
        )
        .register(
            "OrderCancelled",
            handler_fn(|message| async move {
                info!(
                    body = %message.body(),
                    correlation_id = message.attribute("correlation_id").unwrap_or("-"),
                    "↩️ Order cancelled"
                );
                Ok(())
            }),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => ConfigLoader::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => demo_settings(),
    };

    let configuration = BusConfigurationBuilder::from_settings(&settings)
        .handlers(handlers())
        .queue("shipping", |q| q.middleware(MessageTypeFilter::new(["OrderPlaced"])))
        .build()
        .context("building bus configuration")?;

    let provider = Arc::new(InMemoryProvider::new());
    provider.create_topic(TOPIC);
    for queue in configuration.queues() {
        provider.subscribe(TOPIC, &queue.name);
    }

    let counts = Arc::new(CountingMonitor::new());
    let monitor = CompositeMonitor::new()
        .with(Arc::new(TracingMonitor))
        .with(counts.clone());

    let dispatcher = Dispatcher::new(Arc::new(configuration), provider.clone(), Arc::new(monitor));
    let handle = dispatcher
        .start(CancellationToken::new())
        .await
        .context("starting dispatcher")?;

    let publisher_provider = provider.clone();
    let order_count = cli.orders;
    let publisher = tokio::spawn(async move {
        for order_id in 1..=order_count {
            let message = if order_id % 5 == 0 {
                OutboundMessage::new(format!(r#"{{"order_id":{order_id}}}"#))
                    .with_message_type("OrderCancelled")
            } else {
                OutboundMessage::json(&OrderPlaced {
                    order_id,
                    amount_cents: fastrand::u64(500..50_000),
                })?
                .with_message_type("OrderPlaced")
            };
            let message = message.with_attribute("correlation_id", Uuid::new_v4().to_string());
            publisher_provider.publish(TOPIC, message)?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::Ok(())
    });

    match cli.duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            info!("Press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
    }

    publisher.abort();
    let report = handle.stop().await;
    let snapshot = counts.snapshot();

    info!(
        graceful = report.graceful,
        received = snapshot.received,
        succeeded = snapshot.succeeded,
        failed = snapshot.failed,
        dead_lettered = snapshot.dead_lettered,
        billing_dlq = provider.queue_depth("billing-dlq"),
        "📊 Demo finished"
    );
    Ok(())
}
