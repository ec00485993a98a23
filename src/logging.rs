//! # Structured Logging
//!
//! Environment-aware `tracing` setup. Console output by default, JSON lines
//! when `BUS_LOG_FORMAT=json`. The level comes from `RUST_LOG` when set,
//! otherwise from the environment (`BUS_ENV` / `APP_ENV`).

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process
///
/// Safe to call repeatedly and alongside a subscriber installed elsewhere
/// (e.g. by a test harness); an existing global subscriber is kept.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var("BUS_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

        let initialized = if json {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true).with_thread_ids(true))
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).with_thread_ids(true))
                .try_init()
        };

        if initialized.is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
            return;
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Current environment from `BUS_ENV` or `APP_ENV`
fn get_environment() -> String {
    std::env::var("BUS_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Default level per environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}
