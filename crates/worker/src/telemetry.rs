// Logging setup for the worker process

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_ENGINE_LEVEL: &str = "info";

/// Resolve the log filter
///
/// `RUST_LOG` wins. Otherwise `LOG_LEVEL` sets the worker's own level and
/// the engine stays at info.
pub fn log_filter(rust_log: Option<&str>, log_level: Option<&str>) -> String {
    if let Some(filter) = rust_log.filter(|f| !f.trim().is_empty()) {
        return filter.to_string();
    }
    let level = log_level.unwrap_or("debug");
    format!("carepath_worker={level},carepath_engine={DEFAULT_ENGINE_LEVEL}")
}

/// Install the global subscriber
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let log_level = std::env::var("LOG_LEVEL").ok();
    let filter = log_filter(rust_log.as_deref(), log_level.as_deref());

    let filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .init();
}
