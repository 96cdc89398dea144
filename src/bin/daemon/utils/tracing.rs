//! Tracing Utilities Module
//!
//! This module contains tracing functionality for the mechd daemon,
//! including logging configuration with file output.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the non-blocking writer flushing for the lifetime of the process
static WORKER_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initializes the tracing subscriber with file and console output
///
/// When the log file cannot be opened the daemon keeps running with console output only.
/// Later calls are no-ops.
///
/// # Arguments
/// * `log_path` - File the log is appended to
pub fn setup_tracing(log_path: &Path) {
    WORKER_GUARD.get_or_init(|| {
        let (subscriber, guard, failure) = build_subscriber(log_path);
        let _ = subscriber.try_init();

        if let Some(e) = failure {
            tracing::warn!(
                "Cannot open log file {}: {}, logging to stdout only",
                log_path.display(),
                e
            );
        }
        guard
    });
}

/// Build the subscriber without installing it
///
/// # Returns
/// * The subscriber, the file writer guard, and the open error when the file layer was
///   left out
pub(crate) fn build_subscriber(
    log_path: &Path,
) -> (
    Box<dyn Subscriber + Send + Sync>,
    Option<WorkerGuard>,
    Option<io::Error>,
) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Configure stdout layer for console output
    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_filter(env_filter.clone());

    let (file_layer, guard, failure) =
        match OpenOptions::new().append(true).create(true).open(log_path) {
            Ok(file) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file);
                let layer = fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_filter(env_filter);
                (Some(layer), Some(guard), None)
            }
            Err(e) => (None, None, Some(e)),
        };

    let subscriber = tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer);
    (Box::new(subscriber), guard, failure)
}
