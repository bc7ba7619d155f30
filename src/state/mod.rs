//! State management module.
//!
//! This module provides persistent storage of last-applied resource records
//! and the run lock that guards `apply` and `destroy`.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{KeyedLocks, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{STATE_VERSION, StateRecord, StateSnapshot};

use crate::config::{StateBackend, StateConfig};
use crate::error::Result;

/// Builds the state store described by the configuration.
///
/// # Errors
///
/// Returns an error if the S3 client cannot be created.
pub async fn open_store(config: &StateConfig) -> Result<Box<dyn StateStore>> {
    let store: Box<dyn StateStore> = match config.backend {
        StateBackend::Local => match &config.path {
            Some(path) => Box::new(LocalStateStore::with_base_dir(path).with_lock_ttl(config.lock_ttl())),
            None => Box::new(LocalStateStore::new()?.with_lock_ttl(config.lock_ttl())),
        },
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().unwrap_or_default();
            Box::new(
                S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref())
                    .await?
                    .with_lock_ttl(config.lock_ttl()),
            )
        }
    };
    Ok(store)
}
