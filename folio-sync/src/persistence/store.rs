//! Key/value primitives shared by every storage backend.
//!
//! Three value shapes are supported, each living under its own key:
//! - ordered logs (`append` / `range` / `trim`), entries tagged with a
//!   store-wide monotonically increasing sequence number
//! - single blobs (`get` / `set`)
//! - member sets (`add_member` / `remove_member` / `members`)
//!
//! Every write renews the key's time-to-live. Expired keys read as absent
//! and are physically removed by `purge_expired`.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Default inactivity window before a document's keys may be collected.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Storage errors. Serializable so a remote store can hand them back as is.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage task failed: {0}")]
    Task(String),
    #[error("store unavailable")]
    Unavailable,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Expiry policy applied to every persisted document key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub ttl: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

impl RetentionPolicy {
    /// Absolute expiry, in seconds since the Unix epoch, for a write made now.
    pub fn expires_at(&self, now: SystemTime) -> u64 {
        unix_secs(now).saturating_add(self.ttl.as_secs())
    }
}

pub(crate) fn unix_secs(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Synchronous storage primitives. Callers on the async runtime go through
/// [`PersistenceGateway`](super::PersistenceGateway), which moves calls onto
/// the blocking pool.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Append `value` to the log at `key`, returning its sequence number.
    fn append(&self, key: &str, value: &[u8], ttl: Duration) -> Result<u64, StoreError>;

    /// Every entry of the log at `key`, in sequence order.
    fn range(&self, key: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;

    /// Delete log entries with sequence `<= up_to`. Returns how many went.
    fn trim(&self, key: &str, up_to: u64) -> Result<u64, StoreError>;

    /// Highest sequence in the log at `key`.
    fn last_seq(&self, key: &str) -> Result<Option<u64>, StoreError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Write the blob at `key` only if it currently holds `expected`
    /// (`None` meaning absent or expired). Returns whether the write happened.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError>;

    fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError>;

    fn members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Remove `key` whatever shape it holds.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop every key whose expiry is before `now`. Returns keys removed.
    fn purge_expired(&self, now: SystemTime) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retention_is_seven_days() {
        assert_eq!(RetentionPolicy::default().ttl, Duration::from_secs(604_800));
    }

    #[test]
    fn test_expires_at_adds_ttl() {
        let policy = RetentionPolicy {
            ttl: Duration::from_secs(60),
        };
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        assert_eq!(policy.expires_at(at), 1_060);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Database("disk full".into());
        assert_eq!(err.to_string(), "database error: disk full");
    }
}
