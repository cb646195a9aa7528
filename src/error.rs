//! Error types for the Tollgate rate limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Tollgate operations.
///
/// Lock contention is deliberately absent: failing to obtain the bucket lock
/// is a normal outcome reported as a rejected reduction, not an error.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing store failed to serve a request.
    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The bucket was configured with a non-positive capacity, refill amount
    /// or refill period.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No unused bucket key was found within the bounded search.
    #[error("Key space exhausted after {attempts} attempts")]
    KeySpaceExhausted { attempts: usize },

    /// A bucket operation was attempted before `init()` completed.
    #[error("Token bucket used before init()")]
    NotInitialized,

    /// Settings-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error reports a degraded backing store.
    ///
    /// Callers pick their own fail-open or fail-closed policy on these.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, Error>;
