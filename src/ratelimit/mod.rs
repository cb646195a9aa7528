//! Token bucket rate limiting over a shared backing store.

mod bucket;
mod config;
mod key;
mod lock;

pub use bucket::{BucketState, Reduction, Refill, TokenBucketLimiter, MAX_KEY_ATTEMPTS};
pub use config::{BucketConfig, BucketConfigBuilder, DEFAULT_KEY_PREFIX, DEFAULT_RETRY_INTERVAL};
pub use key::BucketKey;
pub use lock::{LockGuard, PollingLock};
