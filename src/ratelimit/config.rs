//! Token bucket configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Namespace used for generated bucket keys when none is given.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate";
/// Delay between two lock acquisition attempts when none is given.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1);
/// Lock polling budget used to derive the default attempt count.
const LOCK_BUDGET_MILLIS: u64 = 100;

/// Default refill amount used by [`BucketConfigBuilder::default`].
const DEFAULT_REFILL_AMOUNT: u64 = 100;
/// Default refill period used by [`BucketConfigBuilder::default`].
const DEFAULT_REFILL_PERIOD: Duration = Duration::from_secs(60);
/// Default capacity used by [`BucketConfigBuilder::default`].
const DEFAULT_CAPACITY: u64 = 1000;

/// Validated, immutable configuration of a token bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    refill_amount: u64,
    refill_period: Duration,
    capacity: u64,
    key_prefix: String,
    key: Option<String>,
    retry_interval: Duration,
    max_lock_attempts: usize,
}

impl BucketConfig {
    /// Start building a configuration.
    pub fn builder(refill_amount: u64, refill_period: Duration, capacity: u64) -> BucketConfigBuilder {
        BucketConfigBuilder {
            refill_amount,
            refill_period,
            capacity,
            ..BucketConfigBuilder::default()
        }
    }

    /// Tokens credited per refill tick.
    pub fn refill_amount(&self) -> u64 {
        self.refill_amount
    }

    /// Length of one refill tick.
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Length of one refill tick in milliseconds. Validation guarantees it
    /// is a whole number of at least 1.
    pub fn refill_period_millis(&self) -> u64 {
        millis(self.refill_period)
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Namespace for generated keys.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Caller-supplied key of an existing bucket, if any.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Delay between lock attempts.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Number of lock attempts before a reduction gives up.
    pub fn max_lock_attempts(&self) -> usize {
        self.max_lock_attempts
    }
}

/// Builder for [`BucketConfig`].
///
/// The default builder describes a bucket of 1000 tokens refilled by 100
/// tokens every minute.
#[derive(Debug, Clone)]
pub struct BucketConfigBuilder {
    refill_amount: u64,
    refill_period: Duration,
    capacity: u64,
    key_prefix: String,
    key: Option<String>,
    retry_interval: Duration,
    max_lock_attempts: Option<usize>,
}

impl Default for BucketConfigBuilder {
    fn default() -> Self {
        Self {
            refill_amount: DEFAULT_REFILL_AMOUNT,
            refill_period: DEFAULT_REFILL_PERIOD,
            capacity: DEFAULT_CAPACITY,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_lock_attempts: None,
        }
    }
}

impl BucketConfigBuilder {
    pub fn refill_amount(mut self, amount: u64) -> Self {
        self.refill_amount = amount;
        self
    }

    pub fn refill_period(mut self, period: Duration) -> Self {
        self.refill_period = period;
        self
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Bind to an existing bucket instead of generating a fresh key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Override the attempt count derived from the retry interval.
    pub fn max_lock_attempts(mut self, attempts: usize) -> Self {
        self.max_lock_attempts = Some(attempts);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<BucketConfig> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if self.refill_amount == 0 {
            return Err(Error::InvalidConfiguration(
                "refill amount must be greater than zero".to_string(),
            ));
        }
        if self.refill_period.as_millis() == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "refill period must be at least 1ms, got {:?}",
                self.refill_period
            )));
        }
        if self.refill_period.subsec_nanos() % 1_000_000 != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "refill period must be a whole number of milliseconds, got {:?}",
                self.refill_period
            )));
        }
        if self.max_lock_attempts == Some(0) {
            return Err(Error::InvalidConfiguration(
                "max lock attempts must be greater than zero".to_string(),
            ));
        }

        let max_lock_attempts = self
            .max_lock_attempts
            .unwrap_or_else(|| derived_lock_attempts(self.retry_interval));

        Ok(BucketConfig {
            refill_amount: self.refill_amount,
            refill_period: self.refill_period,
            capacity: self.capacity,
            key_prefix: self.key_prefix,
            key: self.key,
            retry_interval: self.retry_interval,
            max_lock_attempts,
        })
    }
}

/// `max(floor(100ms / retry_interval), 1)`, with sub-millisecond intervals
/// counted as 1ms.
fn derived_lock_attempts(retry_interval: Duration) -> usize {
    let attempts = LOCK_BUDGET_MILLIS / millis(retry_interval);
    usize::try_from(attempts).unwrap_or(usize::MAX).max(1)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}
