//! Run log: one file per day, appended to by every run of that day.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// `{dir}/{YYYYMMDD}-ANAPLAN-RUN.LOG` for the local date.
pub fn log_file_path(dir: &Path) -> PathBuf {
    let day = chrono::Local::now().format("%Y%m%d");
    dir.join(format!("{day}-ANAPLAN-RUN.LOG"))
}

/// Install the global subscriber writing to the dated log file.
///
/// The level comes from `RUST_LOG`, defaulting to `info`.
pub fn init(dir: &Path) -> Result<PathBuf> {
    let path = log_file_path(dir);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "logger started");
    Ok(path)
}
