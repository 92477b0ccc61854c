//! Error types for crashpost-core

use thiserror::Error;

/// Main error type for the crashpost-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Report queue error (bad file name, missing report, wrong queue state)
    #[error("report store error: {0}")]
    Store(String),

    /// A field collector failed
    #[error("collector {collector} failed: {message}")]
    Collector { collector: String, message: String },

    /// A report sender failed to deliver
    #[error("sender {sender} failed: {message}")]
    Sender { sender: String, message: String },

    /// Async runtime error (spawn, join, timeout)
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Shorthand for a collector failure.
    pub fn collector(collector: &str, message: impl Into<String>) -> Self {
        Error::Collector {
            collector: collector.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a sender failure.
    pub fn sender(sender: &str, message: impl Into<String>) -> Self {
        Error::Sender {
            sender: sender.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for crashpost-core
pub type Result<T> = std::result::Result<T, Error>;
