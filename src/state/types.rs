//! State types for tracking applied resources.
//!
//! A record is the last-applied view of one resource: its provider handle,
//! the attributes it was applied with and their content hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::StateError;
use crate::graph::{Attributes, ResourceId};

/// Current version of the record format.
pub const STATE_VERSION: &str = "1";

/// Last-applied state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record format version.
    pub version: String,
    /// Resource identifier.
    pub id: ResourceId,
    /// Provider handle (ARN-like).
    pub handle: String,
    /// Declared attributes as last applied, references unresolved.
    pub attributes: Attributes,
    /// Content hash of `attributes`.
    pub attributes_hash: String,
    /// Dependencies the resource was applied with.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// When the resource was last created or updated.
    pub applied_at: DateTime<Utc>,
}

impl StateRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        id: ResourceId,
        handle: impl Into<String>,
        attributes: Attributes,
        attributes_hash: impl Into<String>,
        dependencies: BTreeSet<ResourceId>,
    ) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            id,
            handle: handle.into(),
            attributes,
            attributes_hash: attributes_hash.into(),
            dependencies,
            applied_at: Utc::now(),
        }
    }

    /// Checks the record format version.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` for records written by an incompatible format.
    pub fn check_version(&self) -> Result<(), StateError> {
        if self.version == STATE_VERSION {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }
}

/// Point-in-time copy of every record in a store.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    records: BTreeMap<ResourceId, StateRecord>,
    taken_at: DateTime<Utc>,
}

impl StateSnapshot {
    /// Builds a snapshot from a set of records.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            taken_at: Utc::now(),
        }
    }

    /// Returns the record for an identifier.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Returns true if a record exists for the identifier.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.records.contains_key(id)
    }

    /// Iterates over records in identifier order.
    pub fn records(&self) -> impl Iterator<Item = &StateRecord> {
        self.records.values()
    }

    /// Finds a record by logical name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&StateRecord> {
        self.records.values().find(|r| r.id.name == name)
    }

    /// Records whose stored dependencies include `id`.
    #[must_use]
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<&StateRecord> {
        self.records
            .values()
            .filter(|r| r.dependencies.contains(id))
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the snapshot has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When the snapshot was taken.
    #[must_use]
    pub const fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Content hash over every record's identity, handle, attribute hash and
    /// dependencies. Equal record sets give equal fingerprints regardless of
    /// when they were read.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for record in self.records.values() {
            hasher.update(record.id.storage_key().as_bytes());
            hasher.update([0]);
            hasher.update(record.handle.as_bytes());
            hasher.update([0]);
            hasher.update(record.attributes_hash.as_bytes());
            for dep in &record.dependencies {
                hasher.update([1]);
                hasher.update(dep.storage_key().as_bytes());
            }
            hasher.update([0xff]);
        }
        hex::encode(hasher.finalize())
    }
}
