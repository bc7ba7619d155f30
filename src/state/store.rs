//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{StateRecord, StateSnapshot};
use crate::error::Result;
use crate::graph::ResourceId;

/// Trait for state storage backends.
///
/// Writes to one identifier are serialized; writes to different identifiers
/// may proceed concurrently.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the record of a resource.
    ///
    /// Returns `None` if the resource was never applied.
    async fn load(&self, id: &ResourceId) -> Result<Option<StateRecord>>;

    /// Atomically creates or replaces a record.
    async fn save(&self, record: &StateRecord) -> Result<()>;

    /// Removes a record. Removing a missing record is not an error.
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// Returns a point-in-time copy of all records.
    async fn snapshot(&self) -> Result<StateSnapshot>;

    /// Acquires the run lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends the run lock held as `lock_id` by its full lifetime.
    ///
    /// Returns `LockLost` if the lock expired and was taken over, or was
    /// removed.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the run lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Removes the run lock regardless of its holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        (**self).load(id).await
    }

    async fn save(&self, record: &StateRecord) -> Result<()> {
        (**self).save(record).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        (**self).delete(id).await
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        (**self).snapshot().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).refresh_lock(lock_id).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
