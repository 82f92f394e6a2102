//! Error types for the cellsync server.

use std::path::PathBuf;

/// Server error type.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Core error (stale cell, unknown notebook, bad edit).
    #[error("Core error: {0}")]
    Core(#[from] cellsync_core::Error),

    /// Delivering a notification to one client failed.
    #[error("Failed to notify client '{client}': {message}")]
    ClientSend { client: String, message: String },

    /// A request to the backend language server failed.
    #[error("Backend request '{method}' failed: {message}")]
    BackendRequest { method: String, message: String },

    /// A request was cancelled before the backend answered.
    #[error("Request cancelled")]
    Cancelled,

    /// Backend connection error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Virtual document storage error.
    #[error("Store error for {uri}: {message}")]
    Store { uri: String, message: String },

    /// IO error.
    #[error("IO error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Watch error.
    #[error("File watch error: {0}")]
    Watch(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            message: e.to_string(),
        }
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
