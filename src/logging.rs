//! Logging setup.
//!
//! Console output at INFO (DEBUG with `--debug`), overridable with `RUST_LOG`.
//! A daily-rotated `client.log` in the config directory always records DEBUG.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "client.log";

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logging(debug: bool, log_dir: Option<&Path>) {
    let console_level = if debug { "debug" } else { "info" };
    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("ollama_bridge={},reqwest=warn", console_level))
    });
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: failed to create log directory {}: {}", dir.display(), e);
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
        Some(
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(true)
                .with_filter(EnvFilter::new("ollama_bridge=debug")),
        )
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
}
