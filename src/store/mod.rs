//! Backing stores holding bucket state outside the limiter.
//!
//! The limiter only needs four operations from a store: scalar `get`/`set`
//! and an advisory per-key `lock`/`unlock`. Two implementations ship with the
//! crate: an in-process [`MemoryStore`] and a [`RemoteStore`] that talks to a
//! [`StoreServer`] owned by another process.

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod protocol;
mod remote;
mod server;

pub use memory::MemoryStore;
pub use protocol::{Request, Response};
pub use remote::RemoteStore;
pub use server::{StoreServer, MAX_REQUEST_BYTES};

/// Errors raised by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Connection closed")]
    Closed,
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Trait for key-value stores that can hold token bucket state.
///
/// `lock` must be an atomic test-and-set: it returns `true` only for the one
/// caller that flipped the flag, and never blocks waiting for a holder. The
/// limiter's mutual exclusion rests entirely on that property.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Fetch a value; `None` if the key was never set.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Insert or overwrite a value.
    async fn set(&self, key: &str, value: u64) -> Result<(), StoreError>;

    /// Try to take the named lock without waiting.
    async fn lock(&self, key: &str) -> Result<bool, StoreError>;

    /// Release the named lock. Releasing a free lock is a no-op.
    async fn unlock(&self, key: &str) -> Result<(), StoreError>;
}
