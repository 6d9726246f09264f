//! Tracing setup for hosts that embed the engine
//!
//! Logs go to a daily-rotated file; debug builds mirror them to stdout.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;

/// Log file name prefix (rotation appends the date)
pub const LOG_FILE_NAME: &str = "text-region-engine.log";

/// Default log directory under the platform config folder
pub fn default_log_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("TextRegionEngine").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Install the global subscriber
///
/// Filter comes from `RUST_LOG` (default `info`). If a subscriber is already
/// installed the existing one is kept. Keep the returned guard alive for as
/// long as logs should be flushed.
pub fn init_tracing(log_dir: &Path) -> WorkerGuard {
    use tracing_appender::rolling;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Create log directory if it doesn't exist
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Warning: Failed to create log directory: {}", e);
    }

    let file_appender = rolling::daily(log_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true);

    #[cfg(debug_assertions)]
    let result = {
        let console_layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(console_layer)
            .try_init()
    };

    #[cfg(not(debug_assertions))]
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init();

    match result {
        Ok(()) => tracing::info!("Log directory: {}", log_dir.display()),
        Err(_) => tracing::debug!("Tracing subscriber already installed"),
    }

    guard
}
