//! Plan types and construction.
//!
//! A plan compares the validated graph with a state snapshot. Creates,
//! updates and no-ops follow the topological order of the graph; deletes
//! follow the reverse order of the dependencies recorded in state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use crate::config::AttributeHasher;
use crate::error::{PlanError, Result};
use crate::graph::{Attributes, ResourceGraph, ResourceId, ResourceNode};
use crate::state::{StateRecord, StateSnapshot};

use super::diff::AttributeDiff;

/// Operation of a planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Create a new resource.
    Create,
    /// Apply an incremental change to an existing resource.
    Update,
    /// Delete a resource.
    Delete,
    /// Resource already converged.
    #[serde(rename = "noop")]
    NoOp,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        f.write_str(s)
    }
}

/// Backend state that differs from the last-applied record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "drift", rename_all = "lowercase")]
pub enum Drift {
    /// The handle no longer resolves.
    Missing,
    /// Observed attributes differ. The diff goes from observed to recorded.
    Changed {
        /// Field changes needed to restore the recorded attributes.
        diff: AttributeDiff,
    },
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Position in the plan.
    pub index: usize,
    /// Target resource.
    pub id: ResourceId,
    /// Operation.
    pub kind: ActionKind,
    /// Field-level diff from recorded to declared attributes.
    pub diff: AttributeDiff,
    /// Dependency rank; deletes count down from the deepest record.
    pub rank: usize,
    /// Indices of actions that must succeed first.
    pub dependencies: Vec<usize>,
    /// Declared attributes, references unresolved.
    #[serde(skip)]
    pub desired: Attributes,
    /// Declared dependencies, persisted with the record.
    #[serde(skip)]
    pub resource_dependencies: BTreeSet<ResourceId>,
    /// Provider handle of an already applied resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Hash of `desired`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,
    /// Why this action was planned.
    pub reason: String,
}

impl PlannedAction {
    /// Returns true if the action calls the provider.
    #[must_use]
    pub fn is_change(&self) -> bool {
        self.kind != ActionKind::NoOp
    }
}

/// Action counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update.
    pub update: usize,
    /// Resources to delete.
    pub delete: usize,
    /// Resources already converged.
    pub unchanged: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.unchanged
        )
    }
}

/// An immutable, ordered set of actions.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    created_at: DateTime<Utc>,
    state_fingerprint: String,
    actions: Vec<PlannedAction>,
}

impl Plan {
    fn new(actions: Vec<PlannedAction>, snapshot: &StateSnapshot) -> Self {
        Self {
            created_at: Utc::now(),
            state_fingerprint: snapshot.fingerprint(),
            actions,
        }
    }

    /// When the plan was computed.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Fingerprint of the state snapshot the plan was computed from.
    #[must_use]
    pub fn state_fingerprint(&self) -> &str {
        &self.state_fingerprint
    }

    /// Actions in execution order.
    #[must_use]
    pub fn actions(&self) -> &[PlannedAction] {
        &self.actions
    }

    /// Consumes the plan.
    #[must_use]
    pub fn into_actions(self) -> Vec<PlannedAction> {
        self.actions
    }

    /// Action targeting a resource.
    #[must_use]
    pub fn action_for(&self, id: &ResourceId) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| &a.id == id)
    }

    /// Number of actions, including no-ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if the plan has no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns true if at least one action calls the provider.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(PlannedAction::is_change)
    }

    /// Counts actions by kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        self.actions
            .iter()
            .fold(PlanSummary::default(), |mut summary, action| {
                match action.kind {
                    ActionKind::Create => summary.create += 1,
                    ActionKind::Update => summary.update += 1,
                    ActionKind::Delete => summary.delete += 1,
                    ActionKind::NoOp => summary.unchanged += 1,
                }
                summary
            })
    }
}

/// Computes plans from a graph and a state snapshot.
#[derive(Debug, Default)]
pub struct Planner {
    hasher: AttributeHasher,
    drift: BTreeMap<ResourceId, Drift>,
}

impl Planner {
    /// Creates a planner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds observed drift into planning: missing resources are recreated
    /// and changed ones updated back to their declared attributes.
    #[must_use]
    pub fn with_drift(mut self, drift: BTreeMap<ResourceId, Drift>) -> Self {
        self.drift = drift;
        self
    }

    /// Plans the changes that converge the backend to `graph`.
    ///
    /// # Errors
    ///
    /// Returns a graph error if the graph is invalid, or `PlanConflict` if a
    /// resource is targeted by both an update and a delete, or if a present
    /// resource depends on one declared absent.
    pub fn plan(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<Plan> {
        let ranks = graph.ranks()?;
        self.check_conflicts(graph, snapshot)?;

        let mut actions: Vec<PlannedAction> = Vec::new();
        let mut index_of: HashMap<ResourceId, usize> = HashMap::new();

        for node in graph.topological_order()? {
            if !node.is_present() {
                continue;
            }
            let index = actions.len();
            let dependencies = node
                .dependencies
                .iter()
                .filter_map(|d| index_of.get(d).copied())
                .collect();
            let rank = ranks.get(&node.id).copied().unwrap_or_default();
            let action = self.forward_action(index, node, snapshot.get(&node.id), rank, dependencies);
            debug!("Planned {} {}", action.kind, action.id);
            index_of.insert(node.id.clone(), index);
            actions.push(action);
        }

        let doomed: Vec<&StateRecord> = snapshot
            .records()
            .filter(|r| graph.get(&r.id).is_none_or(|n| !n.is_present()))
            .collect();
        append_deletes(&mut actions, &index_of, &doomed, snapshot, |r| {
            if graph.contains(&r.id) {
                String::from("declared absent")
            } else {
                String::from("no longer declared")
            }
        })?;

        Ok(Plan::new(actions, snapshot))
    }

    /// Plans the deletion of every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns `DependencyResolutionFailed` if the recorded dependencies
    /// form a cycle.
    pub fn plan_destroy(&self, snapshot: &StateSnapshot) -> Result<Plan> {
        let mut actions = Vec::new();
        let records: Vec<&StateRecord> = snapshot.records().collect();
        append_deletes(&mut actions, &HashMap::new(), &records, snapshot, |_| {
            String::from("destroy requested")
        })?;
        Ok(Plan::new(actions, snapshot))
    }

    fn check_conflicts(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Result<()> {
        for node in graph.nodes() {
            if node.is_present() {
                if let Some(absent) = node
                    .dependencies
                    .iter()
                    .find(|d| graph.get(d).is_some_and(|dep| !dep.is_present()))
                {
                    return Err(PlanError::PlanConflict {
                        id: absent.clone(),
                        reason: format!("declared absent but {} still depends on it", node.id),
                    }
                    .into());
                }
            } else if let Some(record) = snapshot.get(&node.id)
                && !node.attributes.is_empty()
                && self.hasher.hash_attributes(&node.attributes) != record.attributes_hash
            {
                return Err(PlanError::PlanConflict {
                    id: node.id.clone(),
                    reason: String::from(
                        "declared absent with attributes that differ from the applied ones",
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    fn forward_action(
        &self,
        index: usize,
        node: &ResourceNode,
        record: Option<&StateRecord>,
        rank: usize,
        dependencies: Vec<usize>,
    ) -> PlannedAction {
        let new_hash = self.hasher.hash_attributes(&node.attributes);

        let (kind, diff, handle, reason) = match (record, self.drift.get(&node.id)) {
            (None, _) => (
                ActionKind::Create,
                AttributeDiff::created(&node.attributes),
                None,
                String::from("not yet applied"),
            ),
            (Some(_), Some(Drift::Missing)) => (
                ActionKind::Create,
                AttributeDiff::created(&node.attributes),
                None,
                String::from("missing from backend"),
            ),
            (Some(record), _) if record.attributes_hash != new_hash => (
                ActionKind::Update,
                AttributeDiff::between(&record.attributes, &node.attributes),
                Some(record.handle.clone()),
                String::from("declared attributes changed"),
            ),
            (Some(record), Some(Drift::Changed { diff })) => (
                ActionKind::Update,
                diff.clone(),
                Some(record.handle.clone()),
                String::from("drifted from applied attributes"),
            ),
            (Some(record), None) => (
                ActionKind::NoOp,
                AttributeDiff::default(),
                Some(record.handle.clone()),
                String::from("up to date"),
            ),
        };

        PlannedAction {
            index,
            id: node.id.clone(),
            kind,
            diff,
            rank,
            dependencies,
            desired: node.attributes.clone(),
            resource_dependencies: node.dependencies.clone(),
            handle,
            new_hash: Some(new_hash),
            reason,
        }
    }
}

/// Appends one delete per record, dependents before their dependencies.
///
/// A delete waits for the deletes of recorded dependents and for the
/// forward action of any kept resource that was applied depending on it.
fn append_deletes<F>(
    actions: &mut Vec<PlannedAction>,
    forward: &HashMap<ResourceId, usize>,
    doomed: &[&StateRecord],
    snapshot: &StateSnapshot,
    reason: F,
) -> Result<()>
where
    F: Fn(&StateRecord) -> String,
{
    let doomed_ids: BTreeSet<&ResourceId> = doomed.iter().map(|r| &r.id).collect();
    let ranks = record_ranks(doomed, &doomed_ids)?;
    let max_rank = ranks.values().copied().max().unwrap_or_default();

    let mut ordered: Vec<&StateRecord> = doomed.to_vec();
    ordered.sort_by(|a, b| {
        let ra = ranks.get(&a.id).copied().unwrap_or_default();
        let rb = ranks.get(&b.id).copied().unwrap_or_default();
        rb.cmp(&ra).then_with(|| a.id.cmp(&b.id))
    });

    let mut delete_index: HashMap<&ResourceId, usize> = HashMap::new();
    for record in ordered {
        let index = actions.len();
        let mut dependencies: Vec<usize> = snapshot
            .dependents_of(&record.id)
            .into_iter()
            .filter_map(|dependent| {
                delete_index
                    .get(&dependent.id)
                    .or_else(|| forward.get(&dependent.id))
                    .copied()
            })
            .collect();
        dependencies.sort_unstable();

        let rank = max_rank - ranks.get(&record.id).copied().unwrap_or_default();
        debug!("Planned delete {}", record.id);
        actions.push(PlannedAction {
            index,
            id: record.id.clone(),
            kind: ActionKind::Delete,
            diff: AttributeDiff::removed(&record.attributes),
            rank,
            dependencies,
            desired: Attributes::new(),
            resource_dependencies: record.dependencies.clone(),
            handle: Some(record.handle.clone()),
            new_hash: None,
            reason: reason(record),
        });
        delete_index.insert(&record.id, index);
    }
    Ok(())
}

/// Longest recorded dependency path below each doomed record, counting only
/// dependencies that are themselves doomed.
fn record_ranks(
    doomed: &[&StateRecord],
    doomed_ids: &BTreeSet<&ResourceId>,
) -> Result<BTreeMap<ResourceId, usize>> {
    let by_id: BTreeMap<&ResourceId, &StateRecord> = doomed.iter().map(|r| (&r.id, *r)).collect();
    let mut ranks: BTreeMap<ResourceId, usize> = BTreeMap::new();

    // Repeated relaxation; more than n rounds means a recorded cycle.
    for _ in 0..=by_id.len() {
        let mut changed = false;
        for record in by_id.values() {
            let rank = record
                .dependencies
                .iter()
                .filter(|d| doomed_ids.contains(d))
                .map(|d| ranks.get(d).map_or(1, |r| r + 1))
                .max()
                .unwrap_or(0);
            if ranks.get(&record.id) != Some(&rank) {
                ranks.insert(record.id.clone(), rank);
                changed = true;
            }
        }
        if !changed {
            return Ok(ranks);
        }
    }

    Err(PlanError::DependencyResolutionFailed {
        message: String::from("recorded dependencies form a cycle"),
    }
    .into())
}
