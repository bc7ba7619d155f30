//! Local file-based state storage backend.
//!
//! One JSON file per resource under `<base>/records/`, plus the run lock file
//! `<base>/state.lock`. Record writes go to a unique temporary file that is
//! renamed over the target.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};
use crate::graph::ResourceId;

use super::lock::{KeyedLocks, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{StateRecord, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// Record directory name.
const RECORDS_DIR: &str = "records";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory holding one file per record.
    records_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Lifetime of the run lock between refreshes.
    lock_ttl: Duration,
    /// Per-record write locks.
    locks: KeyedLocks,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.converge`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let records_dir = base_dir.join(RECORDS_DIR);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            records_dir,
            lock_path,
            lock_ttl: Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs()),
            locks: KeyedLocks::new(),
        }
    }

    /// Sets how long the run lock lives without a refresh.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Base directory of this store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, id: &ResourceId) -> PathBuf {
        self.records_dir.join(format!("{}.json", id.storage_key()))
    }

    /// Ensures the record directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.records_dir.exists() {
            debug!("Creating state directory: {}", self.records_dir.display());
            fs::create_dir_all(&self.records_dir).await.map_err(|e| {
                ConvergeError::State(StateError::backend(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_record(path: &Path) -> Result<StateRecord> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!(
                "Failed to read {}: {e}",
                path.display()
            )))
        })?;

        let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!(
                "Failed to parse {}: {e}",
                path.display()
            )))
        })?;
        record.check_version()?;
        Ok(record)
    }

    /// Writes `content` to a unique temporary file, then renames it to `path`.
    /// The temporary file is removed if any step fails.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let result = Self::write_then_rename(&temp_path, path, content).await;
        if result.is_err() && fs::remove_file(&temp_path).await.is_ok() {
            debug!("Removed temporary file: {}", temp_path.display());
        }
        result
    }

    async fn write_then_rename(temp_path: &Path, path: &Path, content: &str) -> Result<()> {
        let mut file = fs::File::create(temp_path).await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to create temp file: {e}")))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to write state file: {e}")))
        })?;

        file.sync_all().await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to sync state file: {e}")))
        })?;

        fs::rename(temp_path, path).await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to rename state file: {e}")))
        })?;

        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to read lock file: {e}")))
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::corrupted(format!("Failed to parse lock file: {e}")))
        })?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                ConvergeError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, id: &ResourceId) -> Result<Option<StateRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            debug!("No record for {id}");
            return Ok(None);
        }
        Self::read_record(&path).await.map(Some)
    }

    async fn save(&self, record: &StateRecord) -> Result<()> {
        self.ensure_dir().await?;
        let _guard = self.locks.lock(&record.id).await;

        let path = self.record_path(&record.id);
        debug!("Saving record {} to: {}", record.id, path.display());

        let content = serde_json::to_string_pretty(record).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize record: {e}")))
        })?;

        Self::write_atomic(&path, &content).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let path = self.record_path(id);

        if path.exists() {
            debug!("Deleting record {id}");
            fs::remove_file(&path).await.map_err(|e| {
                ConvergeError::State(StateError::backend(format!("Failed to delete record {id}: {e}")))
            })?;
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        if !self.records_dir.exists() {
            return Ok(StateSnapshot::default());
        }

        let mut entries = fs::read_dir(&self.records_dir).await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to list records: {e}")))
        })?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ConvergeError::State(StateError::backend(format!("Failed to list records: {e}")))
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // A record deleted between listing and reading is simply skipped.
            match Self::read_record(&path).await {
                Ok(record) => records.push(record),
                Err(_) if !path.exists() => {}
                Err(e) => return Err(e),
            }
        }

        info!("Loaded {} records from: {}", records.len(), self.records_dir.display());
        Ok(StateSnapshot::from_records(records))
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(ConvergeError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            warn!("Expired lock held by {} found, taking over", existing.holder);
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::with_ttl(&holder_id, self.lock_ttl);
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to create state directory: {e}"),
            })
        })?;

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        Self::write_atomic(&self.lock_path, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, lock_info.ttl_secs
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock_info = match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => existing,
            _ => {
                return Err(ConvergeError::State(StateError::LockLost {
                    lock_id: lock_id.to_string(),
                }));
            }
        };
        lock_info.refresh();

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        Self::write_atomic(&self.lock_path, &content).await?;
        debug!("Refreshed state lock {lock_id} until {}", lock_info.expires_at.to_rfc3339());
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock at: {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttrValue, Attributes, ResourceKind};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(name: &str, disk: i64) -> StateRecord {
        StateRecord::new(
            ResourceId::new(ResourceKind::NodeGroup, name),
            format!("arn:aws:eks:us-east-1:000000000000:nodegroup/{name}"),
            Attributes::from([(String::from("disk_size"), AttrValue::Int(disk))]),
            format!("hash-{disk}"),
            BTreeSet::new(),
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();
        let rec = record("workers", 100);

        store.save(&rec).await.expect("Failed to save record");

        let loaded = store
            .load(&rec.id)
            .await
            .expect("Failed to load record")
            .expect("Record should exist");
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        let result = store
            .load(&ResourceId::new(ResourceKind::Network, "nope"))
            .await
            .expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_and_leaves_no_temp_files() {
        let (store, temp) = create_test_store();
        store.save(&record("workers", 100)).await.expect("save");
        store.save(&record("workers", 200)).await.expect("save");

        let loaded = store
            .load(&ResourceId::new(ResourceKind::NodeGroup, "workers"))
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.attributes_hash, "hash-200");

        let files: Vec<_> = std::fs::read_dir(temp.path().join(RECORDS_DIR))
            .expect("read dir")
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_saves_to_distinct_records() {
        let (store, _temp) = create_test_store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.save(&record(&format!("group-{i}"), 100)).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("save");
        }

        assert_eq!(store.snapshot().await.expect("snapshot").len(), 8);
    }

    #[tokio::test]
    async fn test_delete_and_snapshot() {
        let (store, _temp) = create_test_store();
        store.save(&record("a", 1)).await.expect("save");
        store.save(&record("b", 2)).await.expect("save");

        store
            .delete(&ResourceId::new(ResourceKind::NodeGroup, "a"))
            .await
            .expect("delete");
        store
            .delete(&ResourceId::new(ResourceKind::NodeGroup, "a"))
            .await
            .expect("second delete is a no-op");

        let snapshot = store.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.find_by_name("b").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_of_empty_store() {
        let (store, _temp) = create_test_store();
        assert!(store.snapshot().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_record_reported() {
        let (store, temp) = create_test_store();
        let dir = temp.path().join(RECORDS_DIR);
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("network__vpc.json"), "{ not json").expect("write");

        let err = store.snapshot().await.expect_err("corrupted");
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");
        assert!(store.get_lock_info().await.expect("lock info").is_some());

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");
        assert!(store.get_lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict_and_force_unlock() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(ConvergeError::State(StateError::LockedByOther { .. }))
        ));

        store.force_unlock().await.expect("force unlock");
        store.acquire_lock("holder-2").await.expect("lock after unlock");
    }

    #[tokio::test]
    async fn test_refresh_lock_persists_new_expiry() {
        let temp = TempDir::new().expect("temp dir");
        let store = LocalStateStore::with_base_dir(temp.path()).with_lock_ttl(Duration::from_secs(1));
        let lock = store.acquire_lock("holder-1").await.expect("acquire");
        assert_eq!(lock.ttl_secs, 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let refreshed = store.refresh_lock(&lock.lock_id).await.expect("refresh");
        let on_disk = store.get_lock_info().await.expect("lock info").expect("locked");
        assert_eq!(on_disk.expires_at, refreshed.expires_at);
        assert!(on_disk.expires_at > lock.expires_at);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.acquire_lock("holder-2").await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_after_takeover_is_lock_lost() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder-1").await.expect("acquire");
        store.force_unlock().await.expect("force unlock");
        store.acquire_lock("holder-2").await.expect("takeover");

        let err = store.refresh_lock(&lock.lock_id).await.expect_err("lost");
        assert!(matches!(err, ConvergeError::State(StateError::LockLost { .. })));
    }

    #[tokio::test]
    async fn test_failed_write_removes_temp_file() {
        let temp = TempDir::new().expect("temp dir");
        // Renaming a file over a non-empty directory fails.
        let target = temp.path().join("target.json");
        std::fs::create_dir_all(target.join("occupied")).expect("mkdir");

        let err = LocalStateStore::write_atomic(&target, "{}").await;
        assert!(err.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
