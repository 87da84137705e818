//! DexSync Exchange State Core Library
//!
//! Client-side real-time state core for an exchange gateway: a
//! reconnecting, authenticated transport client feeding an event-sourced
//! store that maintains deterministic projections of orderbooks, tickers,
//! trades, and the authenticated account, with automatic detection of and
//! recovery from sequence gaps.

pub mod cli;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod session;
pub mod store;

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;

/// Application result type for consistent error handling
pub type AppResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Initialize tracing subscriber for logging.
///
/// With a log file configured, returns the appender guard that must be held
/// for the lifetime of the process.
pub fn init_logging(level: &str, log_file: Option<&str>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("dexsync={level}").into());
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_file {
        Some(path) => {
            let path = Path::new(path);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dexsync.log".to_string());
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}
