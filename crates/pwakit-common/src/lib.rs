//! # PWAKit Common
//!
//! Shared error type, logging setup, and retry helpers used by every PWAKit crate.
//!
//! ## Features
//!
//! - Unified infrastructure error type
//! - `tracing` subscriber configuration
//! - Exponential backoff and timeout utilities

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, retry_with_backoff_if, with_timeout, RetryConfig};

/// Unified error type for PWAKit infrastructure.
#[derive(Error, Debug)]
pub enum PwaKitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl PwaKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            PwaKitError::Config { .. } => "config",
            PwaKitError::Io(_) => "io",
            PwaKitError::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for PWAKit operations.
pub type Result<T> = std::result::Result<T, PwaKitError>;
