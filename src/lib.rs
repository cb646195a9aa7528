//! Tollgate - Distributed Token Bucket Rate Limiting
//!
//! This crate implements a token bucket rate limiter whose state lives in a
//! pluggable key-value store with advisory locks. Any number of tasks or
//! processes sharing a store can draw from the same bucket; reductions are
//! serialized through a bounded polling lock held in the store.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{Error, Result};
pub use ratelimit::{BucketConfig, Reduction, TokenBucketLimiter};
pub use store::{BackingStore, MemoryStore, RemoteStore, StoreServer};
