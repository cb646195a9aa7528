//! Token bucket whose state lives in a shared backing store.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::store::{BackingStore, MemoryStore, StoreError};

use super::config::BucketConfig;
use super::key::BucketKey;
use super::lock::{LockGuard, PollingLock};

/// Upper bound on candidate keys tried by `init()` before giving up.
pub const MAX_KEY_ATTEMPTS: usize = 16;

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Tokens left as of `last_update`.
    pub value: u64,
    /// Epoch milliseconds up to which refills have been settled.
    pub last_update: u64,
}

/// Result of applying the refill rule to a [`BucketState`] at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refill {
    /// Whole refill ticks elapsed since `last_update`.
    pub ticks: u64,
    /// Tokens available after crediting those ticks, capped at capacity.
    pub available: u64,
    /// `last_update` advanced by exactly `ticks` periods.
    pub settled_at: u64,
}

impl BucketState {
    /// A full bucket settled at `now`.
    pub fn full(config: &BucketConfig, now: u64) -> Self {
        Self {
            value: config.capacity(),
            last_update: now,
        }
    }

    /// Credit the whole ticks elapsed up to `now`.
    ///
    /// The settlement point only moves in whole periods so the partial
    /// progress toward the next tick carries over. A `now` earlier than
    /// `last_update` (clock skew between processes) credits nothing.
    pub fn refill(&self, config: &BucketConfig, now: u64) -> Refill {
        let period = config.refill_period_millis();
        let ticks = now.saturating_sub(self.last_update) / period;
        let credited = ticks.saturating_mul(config.refill_amount());

        Refill {
            ticks,
            available: self.value.saturating_add(credited).min(config.capacity()),
            settled_at: self.last_update + ticks * period,
        }
    }
}

/// Outcome of a reduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Tokens were taken; `remaining` are left.
    Consumed { remaining: u64 },
    /// Not enough tokens; nothing was written.
    Insufficient { available: u64 },
    /// The bucket lock could not be taken within the retry budget.
    LockNotAcquired,
}

impl Reduction {
    pub fn is_consumed(&self) -> bool {
        matches!(self, Reduction::Consumed { .. })
    }
}

/// A token bucket rate limiter backed by a [`BackingStore`].
///
/// The limiter holds configuration only; bucket state lives in the store so
/// that any number of limiters, in this process or others, can share one
/// bucket by key. Reductions are serialized through an advisory lock in the
/// store.
pub struct TokenBucketLimiter {
    config: BucketConfig,
    store: Arc<dyn BackingStore>,
    clock: Arc<dyn Clock>,
    lock: PollingLock,
    key: Option<BucketKey>,
    /// Last state read from the store, for diagnostics only.
    last_observed: Mutex<Option<BucketState>>,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

impl TokenBucketLimiter {
    /// Create a limiter over `store`. Call [`init`](Self::init) before use.
    pub fn new(config: BucketConfig, store: Arc<dyn BackingStore>) -> Self {
        let lock = PollingLock::new(config.retry_interval(), config.max_lock_attempts());
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            lock,
            key: None,
            last_observed: Mutex::new(None),
        }
    }

    /// Create a limiter over a private in-memory store.
    pub fn in_memory(config: BucketConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// The bucket key, once `init()` has run.
    pub fn key(&self) -> Option<&BucketKey> {
        self.key.as_ref()
    }

    /// The state most recently read from the store, if any.
    pub fn last_observed(&self) -> Option<BucketState> {
        *self.last_observed.lock()
    }

    /// Bind the limiter to its bucket.
    ///
    /// With an explicit key the existing bucket is adopted, or created full
    /// if the store has never seen it. Otherwise a fresh key is generated,
    /// probing up to [`MAX_KEY_ATTEMPTS`] candidates for one whose value
    /// entry is absent, and the new bucket is filled.
    pub async fn init(&mut self) -> Result<()> {
        if let Some(explicit) = self.config.key() {
            let key = BucketKey::explicit(explicit);
            match self.read_state(&key).await? {
                Some(state) => {
                    info!(key = %key, value = state.value, "Adopted existing token bucket");
                }
                None => {
                    self.fill(&key).await?;
                    info!(key = %key, "Created token bucket under explicit key");
                }
            }
            self.key = Some(key);
            return Ok(());
        }

        let key = self.find_unused_key().await?;
        self.fill(&key).await?;
        info!(
            key = %key,
            capacity = self.config.capacity(),
            refill_amount = self.config.refill_amount(),
            refill_period = ?self.config.refill_period(),
            "Created token bucket"
        );
        self.key = Some(key);
        Ok(())
    }

    async fn find_unused_key(&self) -> Result<BucketKey> {
        for attempt in 1..=MAX_KEY_ATTEMPTS {
            let candidate = BucketKey::random(self.config.key_prefix());
            if self.store.get(&candidate.value_key()).await?.is_none() {
                return Ok(candidate);
            }
            debug!(key = %candidate, attempt, "Bucket key already taken");
        }
        Err(Error::KeySpaceExhausted {
            attempts: MAX_KEY_ATTEMPTS,
        })
    }

    /// Tokens currently available.
    ///
    /// Reads the stored state without locking and projects refills up to now.
    /// Nothing is written back.
    pub async fn get(&self) -> Result<u64> {
        self.get_with(None).await
    }

    /// Like [`get`](Self::get), projecting from `previous` instead of reading
    /// the store when it is given.
    pub async fn get_with(&self, previous: Option<BucketState>) -> Result<u64> {
        let now = self.clock.now_millis();
        let state = match previous {
            Some(state) => state,
            None => {
                let key = self.bound_key()?;
                self.read_state(key)
                    .await?
                    .unwrap_or_else(|| BucketState::full(&self.config, now))
            }
        };

        let refill = state.refill(&self.config, now);
        trace!(
            key = ?self.key,
            value = state.value,
            ticks = refill.ticks,
            available = refill.available,
            "Projected token count"
        );
        Ok(refill.available)
    }

    /// Try to take `tokens` from the bucket.
    ///
    /// Returns `false` both when too few tokens are available and when the
    /// bucket lock stayed busy for the whole retry budget. Store failures are
    /// errors.
    pub async fn reduce(&self, tokens: u64) -> Result<bool> {
        Ok(self.reduce_detailed(tokens).await?.is_consumed())
    }

    /// Like [`reduce`](Self::reduce) but says why a reduction was refused.
    pub async fn reduce_detailed(&self, tokens: u64) -> Result<Reduction> {
        let key = self.bound_key()?;
        let lock_key = key.lock_key();

        if !self.lock.acquire(&*self.store, &lock_key).await? {
            debug!(key = %key, tokens, "Reduction abandoned, bucket lock busy");
            return Ok(Reduction::LockNotAcquired);
        }

        // Released whatever happens inside the critical section, including
        // this future being dropped part way through.
        let guard = LockGuard::new(Arc::clone(&self.store), lock_key);
        let outcome = self.reduce_locked(key, tokens).await;
        let released = guard.release().await;

        let reduction = outcome?;
        released?;
        Ok(reduction)
    }

    async fn reduce_locked(&self, key: &BucketKey, tokens: u64) -> Result<Reduction> {
        let state = self.read_state(key).await?;
        let now = self.clock.now_millis();
        let state = state.unwrap_or_else(|| BucketState::full(&self.config, now));
        let refill = state.refill(&self.config, now);

        if tokens > refill.available {
            debug!(
                key = %key,
                tokens,
                available = refill.available,
                "Reduction refused, not enough tokens"
            );
            return Ok(Reduction::Insufficient {
                available: refill.available,
            });
        }

        let next = BucketState {
            value: refill.available - tokens,
            last_update: refill.settled_at,
        };
        self.write_state(key, next).await?;

        trace!(key = %key, tokens, remaining = next.value, "Tokens consumed");
        Ok(Reduction::Consumed {
            remaining: next.value,
        })
    }

    /// Refill the bucket to capacity, settled at now.
    ///
    /// This write does not take the bucket lock, so a reduction running
    /// concurrently may overwrite it or be overwritten by it. Avoid resetting
    /// buckets that are under load.
    pub async fn reset(&self) -> Result<()> {
        let key = self.bound_key()?;
        self.fill(key).await?;
        debug!(key = %key, "Token bucket reset");
        Ok(())
    }

    async fn fill(&self, key: &BucketKey) -> std::result::Result<(), StoreError> {
        let state = BucketState::full(&self.config, self.clock.now_millis());
        self.write_state(key, state).await
    }

    /// Whether the bucket currently holds its full capacity.
    ///
    /// Advisory: it may already be stale when it returns.
    pub async fn is_full(&self) -> Result<bool> {
        Ok(self.get().await? == self.config.capacity())
    }

    fn bound_key(&self) -> Result<&BucketKey> {
        self.key.as_ref().ok_or(Error::NotInitialized)
    }

    async fn read_state(&self, key: &BucketKey) -> std::result::Result<Option<BucketState>, StoreError> {
        let value = self.store.get(&key.value_key()).await?;
        let state = match value {
            None => None,
            Some(value) => {
                let last_update = match self.store.get(&key.last_update_key()).await? {
                    Some(ts) => ts,
                    None => self.clock.now_millis(),
                };
                Some(BucketState { value, last_update })
            }
        };

        if state.is_some() {
            *self.last_observed.lock() = state;
        }
        Ok(state)
    }

    async fn write_state(&self, key: &BucketKey, state: BucketState) -> std::result::Result<(), StoreError> {
        self.store.set(&key.value_key(), state.value).await?;
        self.store.set(&key.last_update_key(), state.last_update).await?;
        *self.last_observed.lock() = Some(state);
        Ok(())
    }
}
