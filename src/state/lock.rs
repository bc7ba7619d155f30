//! Locking for state access.
//!
//! Two kinds of locks live here: the run lock, persisted by each backend so
//! that two `apply` processes cannot work on the same state, and in-process
//! keyed locks that serialize writes to a single record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::graph::ResourceId;

/// Default lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

const fn default_ttl_secs() -> i64 {
    LOCK_EXPIRY_SECS
}

/// Information about a run lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
    /// Lifetime granted by each acquisition or refresh.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
}

impl LockInfo {
    /// Creates a new lock info with the default expiry.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        Self::with_ttl(holder, Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs()))
    }

    /// Creates a new lock info expiring `ttl` from now.
    #[must_use]
    pub fn with_ttl(holder: &str, ttl: Duration) -> Self {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(LOCK_EXPIRY_SECS).max(1);
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            ttl_secs,
        }
    }

    /// Pushes the expiry one full lifetime past now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(self.ttl_secs);
    }

    /// Lifetime granted by each acquisition or refresh.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.unsigned_abs())
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

/// Per-identifier async mutexes.
///
/// The map itself is only held while looking up an entry; the returned guard
/// serializes work on one identifier without blocking the others.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<ResourceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `id`.
    ///
    /// Entries nobody holds or waits on are dropped on the way in, so the
    /// table stays as large as the set of identifiers in use.
    pub async fn lock(&self, id: &ResourceId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|key, mutex| key == id || Arc::strong_count(mutex) > 1);
            Arc::clone(map.entry(id.clone()).or_default())
        };
        mutex.lock_owned().await
    }

    /// Number of identifiers currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if no identifier is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use std::time::Duration;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("test-holder");
        assert_eq!(lock.holder, "test-holder");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > 0);
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let mut lock = LockInfo::with_ttl("holder", Duration::from_secs(2));
        assert_eq!(lock.ttl(), Duration::from_secs(2));
        assert!(lock.remaining_secs() <= 2);

        lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lock.is_expired());

        lock.refresh();
        assert!(!lock.is_expired());
        assert!(lock.expires_at > Utc::now());
    }

    #[test]
    fn test_lock_without_ttl_field_uses_default() {
        let json = r#"{
            "lock_id": "l-1",
            "holder": "old-client",
            "acquired_at": "2026-01-01T00:00:00Z",
            "expires_at": "2026-01-01T00:05:00Z"
        }"#;
        let lock: LockInfo = serde_json::from_str(json).expect("lock parses");
        assert_eq!(lock.ttl_secs, LOCK_EXPIRY_SECS);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }

    #[tokio::test]
    async fn test_keyed_lock_serializes_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let id = ResourceId::new(ResourceKind::Network, "vpc");

        let guard = locks.lock(&id).await;
        let contender = {
            let locks = Arc::clone(&locks);
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.expect("contender finishes");
    }

    #[tokio::test]
    async fn test_keyed_lock_table_does_not_grow() {
        let locks = KeyedLocks::new();
        for i in 0..100 {
            let _guard = locks.lock(&ResourceId::new(ResourceKind::Network, &format!("vpc-{i}"))).await;
        }
        assert_eq!(locks.len(), 1);

        let held = locks.lock(&ResourceId::new(ResourceKind::Network, "held")).await;
        let _other = locks.lock(&ResourceId::new(ResourceKind::Network, "other")).await;
        assert_eq!(locks.len(), 2);
        drop(held);
    }

    #[tokio::test]
    async fn test_keyed_lock_independent_keys() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&ResourceId::new(ResourceKind::Network, "a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&ResourceId::new(ResourceKind::Network, "b")),
        )
        .await;
        assert!(b.is_ok());
    }
}
