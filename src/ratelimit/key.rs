//! Bucket key generation and the store entries derived from it.

/// Separator between key segments.
pub const SEPARATOR: &str = "//";

/// A key that identifies one bucket in the backing store.
///
/// Generated keys have the form `prefix//id`. Each bucket occupies three
/// store entries derived from its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    /// Bind to an existing key verbatim.
    pub fn explicit(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a candidate key under `prefix` with a random 64-bit id.
    pub fn random(prefix: &str) -> Self {
        Self::with_id(prefix, rand::random::<u64>())
    }

    /// Build the key `prefix//id`.
    pub fn with_id(prefix: &str, id: u64) -> Self {
        Self(format!("{}{}{}", prefix, SEPARATOR, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Entry holding the current token count.
    pub fn value_key(&self) -> String {
        self.entry("value")
    }

    /// Entry holding the settled refill timestamp.
    pub fn last_update_key(&self) -> String {
        self.entry("lastUpdate")
    }

    /// Entry used as the bucket's advisory lock.
    pub fn lock_key(&self) -> String {
        self.entry("lock")
    }

    fn entry(&self, name: &str) -> String {
        format!("{}{}{}", self.0, SEPARATOR, name)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BucketKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
