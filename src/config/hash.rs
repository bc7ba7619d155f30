//! Attribute hashing for change detection.
//!
//! Desired attributes are hashed over their canonical JSON form. Attribute
//! maps are ordered, so equal attribute sets always produce equal hashes.

use sha2::{Digest, Sha256};

use crate::graph::Attributes;

/// Hasher for declared resource attributes.
#[derive(Debug, Default)]
pub struct AttributeHasher;

impl AttributeHasher {
    /// Creates a new attribute hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the content hash of a set of attributes.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        // Serializing a BTreeMap of plain values cannot fail.
        let canonical = serde_json::to_vec(attributes).unwrap_or_default();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 12 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, attributes: &Attributes) -> String {
        let full = self.hash_attributes(attributes);
        full[..12].to_string()
    }

    /// Checks whether two hashes match.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        hash1 == hash2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttrValue;

    fn attrs(disk: i64) -> Attributes {
        Attributes::from([
            (String::from("disk_size"), AttrValue::Int(disk)),
            (String::from("instance_types"), AttrValue::strings(["m5.large"])),
        ])
    }

    #[test]
    fn test_hash_deterministic() {
        let hasher = AttributeHasher::new();
        assert_eq!(hasher.hash_attributes(&attrs(100)), hasher.hash_attributes(&attrs(100)));
    }

    #[test]
    fn test_hash_changes_with_value() {
        let hasher = AttributeHasher::new();
        assert_ne!(hasher.hash_attributes(&attrs(100)), hasher.hash_attributes(&attrs(200)));
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let hasher = AttributeHasher::new();
        let mut a = Attributes::new();
        a.insert("x".into(), AttrValue::Int(1));
        a.insert("y".into(), AttrValue::Int(2));
        let mut b = Attributes::new();
        b.insert("y".into(), AttrValue::Int(2));
        b.insert("x".into(), AttrValue::Int(1));

        assert!(AttributeHasher::hashes_match(
            &hasher.hash_attributes(&a),
            &hasher.hash_attributes(&b)
        ));
    }

    #[test]
    fn test_short_hash() {
        let hasher = AttributeHasher::new();
        let short = hasher.short_hash(&attrs(100));
        assert_eq!(short.len(), 12);
        assert!(hasher.hash_attributes(&attrs(100)).starts_with(&short));
    }
}
