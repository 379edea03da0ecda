//! Error types for the Gatekeeper engine.

use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by user-supplied discriminator functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reported by a counter store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend rejected or failed the operation
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend did not answer within the configured deadline
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
}

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// A rule or the engine was configured incorrectly
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The counter store could not serve a request
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A user-supplied discriminator failed while evaluating a request
    #[error("Discriminator for rule '{rule}' failed: {source}")]
    Discriminator {
        rule: String,
        #[source]
        source: BoxError,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        GatekeeperError::Configuration(msg.into())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
