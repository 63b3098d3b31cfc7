//! Error handling for the policy daemon

use std::path::PathBuf;

use thiserror::Error;

/// Daemon-specific error types
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Policy error: {0}")]
    Policy(#[from] panpolicy_core::PolicyError),

    #[error("Call server error: {0}")]
    Call(#[from] panpolicy_core::CallError),

    #[error("Failed to read configuration {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Another daemon is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;
