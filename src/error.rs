//! Crate-wide error type

use thiserror::Error;

/// Errors produced by the daemon core
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Os(#[from] rustix::io::Errno),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("path exceeds {1} bytes: {0}")]
    PathTooLong(String, usize),

    #[error("storage setup failed: {0}")]
    Storage(String),

    #[error("mount failed: {0}")]
    Mount(String),

    #[error("kernel driver error: {0}")]
    Driver(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
