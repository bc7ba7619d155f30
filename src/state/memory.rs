//! In-memory state storage backend, used for dry runs and tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::error::{ConvergeError, Result, StateError};
use crate::graph::ResourceId;

use super::lock::{KeyedLocks, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// State store that keeps records in process memory.
#[derive(Debug)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<ResourceId, StateRecord>>,
    run_lock: RwLock<Option<LockInfo>>,
    lock_ttl: Duration,
    locks: KeyedLocks,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self {
            records: RwLock::default(),
            run_lock: RwLock::default(),
            lock_ttl: Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs()),
            locks: KeyedLocks::new(),
        }
    }
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long the run lock lives without a refresh.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Creates a store pre-populated with the records of a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &StateSnapshot) -> Self {
        let records = snapshot.records().map(|r| (r.id.clone(), r.clone())).collect();
        Self {
            records: RwLock::new(records),
            ..Self::default()
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(id).cloned())
    }

    async fn save(&self, record: &StateRecord) -> Result<()> {
        let _guard = self.locks.lock(&record.id).await;
        debug!("Saving record {} in memory", record.id);
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(StateSnapshot::from_records(records.values().cloned()))
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut current = self.run_lock.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = current.as_ref()
            && !existing.is_expired()
        {
            return Err(ConvergeError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let info = LockInfo::with_ttl(&holder_id, self.lock_ttl);
        *current = Some(info.clone());
        Ok(info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut current = self.run_lock.write().unwrap_or_else(PoisonError::into_inner);
        match current.as_mut() {
            Some(lock) if lock.lock_id == lock_id => {
                lock.refresh();
                Ok(lock.clone())
            }
            _ => Err(ConvergeError::State(StateError::LockLost {
                lock_id: lock_id.to_string(),
            })),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut current = self.run_lock.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *current = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.run_lock.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.run_lock.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, ResourceKind};
    use std::collections::BTreeSet;
    use tokio_test::{assert_err, assert_ok};

    fn record(name: &str) -> StateRecord {
        StateRecord::new(
            ResourceId::new(ResourceKind::Network, name),
            "handle",
            Attributes::new(),
            "hash",
            BTreeSet::new(),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_and_delete() {
        let store = MemoryStateStore::new();
        let rec = record("vpc");

        store.save(&rec).await.expect("save");
        assert_eq!(store.load(&rec.id).await.expect("load"), Some(rec.clone()));

        store.delete(&rec.id).await.expect("delete");
        assert!(store.load(&rec.id).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_from_snapshot_copies_records() {
        let snapshot = StateSnapshot::from_records([record("a"), record("b")]);
        let store = MemoryStateStore::from_snapshot(&snapshot);

        assert_eq!(store.snapshot().await.expect("snapshot").len(), 2);
    }

    #[tokio::test]
    async fn test_run_lock() {
        let store = MemoryStateStore::new();
        let lock = assert_ok!(store.acquire_lock("one").await);
        assert_err!(store.acquire_lock("two").await);

        assert_ok!(store.release_lock("wrong-id").await);
        assert!(assert_ok!(store.get_lock_info().await).is_some());

        assert_ok!(store.release_lock(&lock.lock_id).await);
        assert_ok!(store.acquire_lock("two").await);
    }

    #[tokio::test]
    async fn test_refresh_lock_keeps_it_alive() {
        let store = MemoryStateStore::new().with_lock_ttl(Duration::from_secs(1));
        let lock = assert_ok!(store.acquire_lock("one").await);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let refreshed = assert_ok!(store.refresh_lock(&lock.lock_id).await);
        assert!(refreshed.expires_at > lock.expires_at);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_err!(store.acquire_lock("two").await);
        assert_err!(store.refresh_lock("someone-else").await);
    }
}
