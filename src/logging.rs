//! Logging setup for binaries and tests that embed tabflow.
//!
//! The library only emits `tracing` events. Nothing is printed until the
//! host installs a subscriber, either its own or the one built here.
//!
//! ## Usage
//!
//! ```no_run
//! use tabflow::logging;
//!
//! // Initialize once at startup
//! logging::init()?;
//!
//! tracing::info!("Pipeline host started");
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! `RUST_LOG` overrides the default `info` level, e.g.
//! `RUST_LOG=tabflow=debug` to see per-chunk progress.

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Prefix of the daily log files written by [`init_with_file`]:
/// `tabflow.<date>.log`.
pub const LOG_FILE_PREFIX: &str = "tabflow";

/// Platform log directory.
///
/// Returns:
/// - Windows: `%APPDATA%/tabflow/logs`
/// - macOS: `~/Library/Application Support/tabflow/logs`
/// - Linux: `~/.local/share/tabflow/logs`
pub fn default_log_dir() -> Result<PathBuf> {
    let base_dir = dirs::data_dir().context("Failed to determine data directory")?;
    Ok(base_dir.join("tabflow").join("logs"))
}

fn env_filter() -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create env filter")
}

/// Install a console subscriber.
///
/// Calling it again once a global subscriber exists is a no-op.
///
/// # Errors
///
/// Returns error if the `RUST_LOG` directives and the fallback both fail to parse.
pub fn init() -> Result<()> {
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    // try_init fails only when a subscriber is already installed
    if tracing_subscriber::registry()
        .with(env_filter()?)
        .with(stderr_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Subscriber already installed");
    }
    Ok(())
}

/// Install a console subscriber plus a daily-rotated log under `log_dir`.
/// Returns the directory the log files go to.
///
/// # Errors
///
/// Returns error if the directory or the file appender cannot be created.
pub fn init_with_file(log_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(log_dir)
        .context("Failed to create log file appender")?;

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(appender);

    let installed = tracing_subscriber::registry()
        .with(env_filter()?)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(log_dir = %log_dir.display(), "Logging initialized");
    }
    Ok(log_dir.to_path_buf())
}
