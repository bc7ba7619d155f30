//! Field-level attribute diffs.
//!
//! Nested maps are compared key by key and reported with dotted paths
//! (`block_device.volume_size`); every other value is compared as a whole.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::graph::{AttrValue, Attributes};

/// How a single field changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Field is new.
    Added,
    /// Field exists on both sides with different values.
    Changed,
    /// Field is gone.
    Removed,
}

/// Difference on a single field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// Dotted field path.
    pub field: String,
    /// Type of change.
    pub kind: ChangeKind,
    /// Previous value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<AttrValue>,
    /// New value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<AttrValue>,
}

/// Ordered set of field changes between two attribute maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AttributeDiff {
    changes: Vec<FieldChange>,
}

impl AttributeDiff {
    /// Computes the changes needed to go from `old` to `new`.
    #[must_use]
    pub fn between(old: &Attributes, new: &Attributes) -> Self {
        let mut changes = Vec::new();
        diff_maps("", old, new, &mut changes);
        Self { changes }
    }

    /// Every field of `new` reported as added.
    #[must_use]
    pub fn created(new: &Attributes) -> Self {
        Self::between(&Attributes::new(), new)
    }

    /// Every field of `old` reported as removed.
    #[must_use]
    pub fn removed(old: &Attributes) -> Self {
        Self::between(old, &Attributes::new())
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changed fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// All changes in field order.
    #[must_use]
    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    /// Changes of one kind.
    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &FieldChange> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }

    /// Dotted paths of all changed fields.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }
}

fn diff_maps(
    prefix: &str,
    old: &std::collections::BTreeMap<String, AttrValue>,
    new: &std::collections::BTreeMap<String, AttrValue>,
    out: &mut Vec<FieldChange>,
) {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    for key in keys {
        let field = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match (old.get(key), new.get(key)) {
            (Some(AttrValue::Map(a)), Some(AttrValue::Map(b))) => diff_maps(&field, a, b, out),
            (Some(a), Some(b)) if a == b => {}
            (Some(a), Some(b)) => out.push(FieldChange {
                field,
                kind: ChangeKind::Changed,
                old: Some(a.clone()),
                new: Some(b.clone()),
            }),
            (None, Some(b)) => out.push(FieldChange {
                field,
                kind: ChangeKind::Added,
                old: None,
                new: Some(b.clone()),
            }),
            (Some(a), None) => out.push(FieldChange {
                field,
                kind: ChangeKind::Removed,
                old: Some(a.clone()),
                new: None,
            }),
            (None, None) => {}
        }
    }
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.old, &self.new) {
            (Some(old), Some(new)) => write!(f, "~ {}: {old} -> {new}", self.field),
            (None, Some(new)) => write!(f, "+ {} = {new}", self.field),
            (Some(old), None) => write!(f, "- {} (was {old})", self.field),
            (None, None) => write!(f, "  {}", self.field),
        }
    }
}

impl fmt::Display for AttributeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, change) in self.changes.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{change}")?;
        }
        Ok(())
    }
}
