//! Logging setup
//!
//! One file-writing subscriber, initialized at startup. The log survives
//! the one-shot boot run, so later passes (reload, CLI) append to it.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize the global subscriber writing to `log_path`.
pub fn init(verbose: bool, log_path: &Path) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(log_path)?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Internal(format!("logger already initialized: {e}")))?;

    Ok(())
}
