//! Logger initialization and per-request proxy event logging.

use log::LevelFilter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use tracing::{info, Level};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

static INIT: Once = Once::new();

/// Per-request proxy events are chatty; they are off by default and toggled
/// at runtime by the hosting shell.
static PROXY_EVENTS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize the global logger with environment variable support.
/// Uses the RUST_LOG environment variable for configuration.
pub fn init_logger() {
    INIT.call_once(|| {
        FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .with_level(true)
            .init();

        // Initialize LogTracer to bridge log events to tracing (after subscriber is set up)
        if let Err(e) = LogTracer::init() {
            eprintln!("Warning: Failed to initialize LogTracer: {:?}", e);
        }

        log::set_max_level(LevelFilter::Info);
    });
}

/// Initialize logger with an explicit level instead of reading RUST_LOG.
pub fn init_logger_with_level(level: Level) {
    INIT.call_once(|| {
        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_level(true)
            .init();

        if let Err(e) = LogTracer::init() {
            eprintln!("Warning: Failed to initialize LogTracer: {:?}", e);
        }

        log::set_max_level(match level {
            Level::ERROR => LevelFilter::Error,
            Level::WARN => LevelFilter::Warn,
            Level::INFO => LevelFilter::Info,
            Level::DEBUG => LevelFilter::Debug,
            Level::TRACE => LevelFilter::Trace,
        });
    });
}

/// Map a configured level string onto a tracing Level. Filter-style values
/// (e.g. `"info,hyper=warn"`) yield None; callers fall back to EnvFilter.
pub fn parse_level(level: &str) -> Option<Level> {
    level.parse::<Level>().ok()
}

/// Enable or disable per-request proxy event logging at runtime.
pub fn set_proxy_logging_enabled(enabled: bool) {
    PROXY_EVENTS_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether per-request proxy event logging is currently enabled.
pub fn proxy_logging_enabled() -> bool {
    PROXY_EVENTS_ENABLED.load(Ordering::Relaxed)
}

/// Log a structured proxy event. Carries event name and identifiers only,
/// never credential material.
pub fn proxy_event(event: &str, view_id: Option<&str>, message: std::fmt::Arguments<'_>) {
    if !proxy_logging_enabled() {
        return;
    }
    if let Some(view_id) = view_id {
        info!(target: "preview-proxy", event = event, view_id = view_id, message = %message);
    } else {
        info!(target: "preview-proxy", event = event, message = %message);
    }
}

/// Convenience macro for logging structured proxy events.
#[macro_export]
macro_rules! proxy_event {
    ($event:expr, $view:expr, $($arg:tt)*) => {
        $crate::logging::proxy_event($event, $view, format_args!($($arg)*));
    };
}

/// Convenience macro for logging errors
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*);
    };
}

/// Convenience macro for logging info messages
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*);
    };
}

/// Convenience macro for logging debug messages
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*);
    };
}
