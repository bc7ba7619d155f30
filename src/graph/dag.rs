//! The resource dependency graph.
//!
//! Edges point from a resource to the resources it depends on. The graph is
//! validated once (no dangling identifiers, no cycles) before it is ordered.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::error::GraphError;

use super::node::{LifecyclePhase, ResourceId, ResourceNode};

/// A set of declared resources and the dependencies between them.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<ResourceId, ResourceNode>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Adds a resource.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` if the identifier is already present.
    pub fn add_resource(&mut self, node: ResourceNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateResource { id: node.id });
        }
        debug!("Adding resource {}", node.id);
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Records that `from` depends on `to`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResource` if either endpoint is not in the graph.
    pub fn add_dependency(&mut self, from: &ResourceId, to: &ResourceId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(to) {
            return Err(GraphError::UnknownResource {
                id: to.to_string(),
                referenced_by: Some(from.clone()),
            });
        }
        let node = self
            .nodes
            .get_mut(from)
            .ok_or_else(|| GraphError::UnknownResource {
                id: from.to_string(),
                referenced_by: None,
            })?;
        node.dependencies.insert(to.clone());
        Ok(())
    }

    /// Returns the node with the given identifier.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Returns true if the identifier is in the graph.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Finds a resource by logical name.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&ResourceId> {
        self.nodes.keys().find(|id| id.name == name)
    }

    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over nodes in identifier order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Identifiers of the resources that directly depend on `id`.
    #[must_use]
    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.contains(id))
            .map(|n| &n.id)
            .collect()
    }

    /// Updates the lifecycle phase of a node. Returns false if it is unknown.
    pub fn set_phase(&mut self, id: &ResourceId, phase: LifecyclePhase) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.set_phase(phase);
                true
            }
            None => false,
        }
    }

    /// Checks that every dependency resolves and that there is no cycle.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResource` for a dangling dependency, or
    /// `CyclicDependency` naming the members of the first cycle found.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            if let Some(missing) = node.dependencies.iter().find(|d| !self.nodes.contains_key(d)) {
                return Err(GraphError::UnknownResource {
                    id: missing.to_string(),
                    referenced_by: Some(node.id.clone()),
                });
            }
        }

        let mut visiting = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        for id in self.nodes.keys() {
            self.visit(id, &mut visiting, &mut visited, &mut path)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        id: &'a ResourceId,
        visiting: &mut BTreeSet<&'a ResourceId>,
        visited: &mut BTreeSet<&'a ResourceId>,
        path: &mut Vec<&'a ResourceId>,
    ) -> Result<(), GraphError> {
        if visited.contains(id) {
            return Ok(());
        }
        if visiting.contains(id) {
            let start = path.iter().position(|p| *p == id).unwrap_or(0);
            let mut cycle: Vec<ResourceId> = path[start..].iter().map(|p| (*p).clone()).collect();
            cycle.push(id.clone());
            return Err(GraphError::CyclicDependency { cycle });
        }

        visiting.insert(id);
        path.push(id);
        if let Some(node) = self.nodes.get(id) {
            for dep in &node.dependencies {
                self.visit(dep, visiting, visited, path)?;
            }
        }
        path.pop();
        visiting.remove(id);
        visited.insert(id);
        Ok(())
    }

    /// Validates the graph and returns a lazy topological iterator.
    ///
    /// Resources are yielded rank by rank; within a rank they come out in
    /// lexicographic identifier order.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn topological_order(&self) -> Result<TopologicalOrder<'_>, GraphError> {
        self.validate()?;
        Ok(TopologicalOrder::new(self))
    }

    /// Longest dependency path below every resource.
    ///
    /// # Errors
    ///
    /// Returns the first validation error.
    pub fn ranks(&self) -> Result<BTreeMap<ResourceId, usize>, GraphError> {
        let mut ranks: BTreeMap<ResourceId, usize> = BTreeMap::new();
        for node in self.topological_order()? {
            let rank = node
                .dependencies
                .iter()
                .filter_map(|d| ranks.get(d))
                .max()
                .map_or(0, |r| r + 1);
            ranks.insert(node.id.clone(), rank);
        }
        Ok(ranks)
    }

    /// Rank of a single resource, `None` if unknown or the graph is invalid.
    #[must_use]
    pub fn rank(&self, id: &ResourceId) -> Option<usize> {
        self.ranks().ok()?.get(id).copied()
    }
}

/// Lazy layered topological iterator over a validated graph.
#[derive(Debug)]
pub struct TopologicalOrder<'a> {
    graph: &'a ResourceGraph,
    pending: BTreeMap<&'a ResourceId, usize>,
    dependents: BTreeMap<&'a ResourceId, Vec<&'a ResourceId>>,
    layer: VecDeque<&'a ResourceId>,
    next_layer: BTreeSet<&'a ResourceId>,
}

impl<'a> TopologicalOrder<'a> {
    fn new(graph: &'a ResourceGraph) -> Self {
        let mut pending = BTreeMap::new();
        let mut dependents: BTreeMap<&ResourceId, Vec<&ResourceId>> = BTreeMap::new();
        let mut layer = VecDeque::new();

        for node in graph.nodes.values() {
            pending.insert(&node.id, node.dependencies.len());
            if node.dependencies.is_empty() {
                layer.push_back(&node.id);
            }
            for dep in &node.dependencies {
                dependents.entry(dep).or_default().push(&node.id);
            }
        }

        Self {
            graph,
            pending,
            dependents,
            layer,
            next_layer: BTreeSet::new(),
        }
    }
}

impl<'a> Iterator for TopologicalOrder<'a> {
    type Item = &'a ResourceNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.layer.is_empty() {
            self.layer = std::mem::take(&mut self.next_layer).into_iter().collect();
        }
        let id = self.layer.pop_front()?;

        if let Some(children) = self.dependents.get(id) {
            for child in children {
                if let Some(count) = self.pending.get_mut(child) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.next_layer.insert(child);
                    }
                }
            }
        }

        self.graph.nodes.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, ResourceKind};

    fn id(kind: ResourceKind, name: &str) -> ResourceId {
        ResourceId::new(kind, name)
    }

    fn node(kind: ResourceKind, name: &str) -> ResourceNode {
        ResourceNode::new(id(kind, name), Attributes::new())
    }

    fn cluster_graph() -> ResourceGraph {
        let vpc = id(ResourceKind::Network, "vpc");
        let role = id(ResourceKind::IdentityRole, "admin");
        let cluster = id(ResourceKind::ManagedCluster, "main");
        let nodes = id(ResourceKind::NodeGroup, "workers");

        let mut graph = ResourceGraph::new();
        graph.add_resource(node(ResourceKind::NodeGroup, "workers")).expect("add");
        graph.add_resource(node(ResourceKind::ManagedCluster, "main")).expect("add");
        graph.add_resource(node(ResourceKind::Network, "vpc")).expect("add");
        graph.add_resource(node(ResourceKind::IdentityRole, "admin")).expect("add");
        graph.add_dependency(&cluster, &vpc).expect("dep");
        graph.add_dependency(&cluster, &role).expect("dep");
        graph.add_dependency(&nodes, &cluster).expect("dep");
        graph
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(node(ResourceKind::Network, "vpc")).expect("add");

        let err = graph
            .add_resource(node(ResourceKind::Network, "vpc"))
            .expect_err("duplicate must fail");
        assert!(matches!(err, GraphError::DuplicateResource { .. }));
    }

    #[test]
    fn test_dependency_on_missing_resource_rejected() {
        let mut graph = ResourceGraph::new();
        graph.add_resource(node(ResourceKind::Network, "vpc")).expect("add");

        let err = graph
            .add_dependency(
                &id(ResourceKind::Network, "vpc"),
                &id(ResourceKind::IdentityRole, "ghost"),
            )
            .expect_err("missing endpoint must fail");
        assert!(matches!(err, GraphError::UnknownResource { .. }));
    }

    #[test]
    fn test_validate_reports_dangling_dependency() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(
                node(ResourceKind::ManagedCluster, "main")
                    .depends_on(id(ResourceKind::Network, "missing")),
            )
            .expect("add");

        let err = graph.validate().expect_err("dangling must fail");
        assert_eq!(
            err.to_string(),
            "Unknown resource: network/missing (referenced by managed_cluster/main)"
        );
    }

    #[test]
    fn test_cycle_detected_with_chain() {
        let a = id(ResourceKind::Network, "a");
        let b = id(ResourceKind::ManagedCluster, "b");
        let mut graph = ResourceGraph::new();
        graph.add_resource(node(ResourceKind::Network, "a")).expect("add");
        graph.add_resource(node(ResourceKind::ManagedCluster, "b")).expect("add");
        graph.add_dependency(&a, &b).expect("dep");
        graph.add_dependency(&b, &a).expect("dep");

        let err = graph.validate().expect_err("cycle must fail");
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec![b.clone(), a, b]
            }
        );
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let a = id(ResourceKind::Network, "a");
        let mut graph = ResourceGraph::new();
        graph.add_resource(node(ResourceKind::Network, "a")).expect("add");
        graph.add_dependency(&a, &a).expect("dep");

        assert!(matches!(
            graph.validate(),
            Err(GraphError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let graph = cluster_graph();
        let order: Vec<&ResourceId> = graph
            .topological_order()
            .expect("order")
            .map(|n| &n.id)
            .collect();

        assert_eq!(order.len(), graph.len());
        for (pos, current) in order.iter().enumerate() {
            let node = graph.get(current).expect("node");
            for dep in &node.dependencies {
                let dep_pos = order.iter().position(|o| *o == dep).expect("dep in order");
                assert!(dep_pos < pos, "{dep} must precede {current}");
            }
        }
    }

    #[test]
    fn test_topological_ties_are_lexicographic() {
        let graph = cluster_graph();
        let order: Vec<String> = graph
            .topological_order()
            .expect("order")
            .map(|n| n.id.to_string())
            .collect();

        assert_eq!(
            order,
            vec![
                "identity_role/admin",
                "network/vpc",
                "managed_cluster/main",
                "node_group/workers",
            ]
        );
    }

    #[test]
    fn test_ranks_and_dependents() {
        let graph = cluster_graph();
        let cluster = id(ResourceKind::ManagedCluster, "main");

        assert_eq!(graph.rank(&id(ResourceKind::Network, "vpc")), Some(0));
        assert_eq!(graph.rank(&cluster), Some(1));
        assert_eq!(graph.rank(&id(ResourceKind::NodeGroup, "workers")), Some(2));
        assert_eq!(
            graph.dependents(&cluster),
            vec![&id(ResourceKind::NodeGroup, "workers")]
        );
    }

    #[test]
    fn test_set_phase() {
        let mut graph = cluster_graph();
        let vpc = id(ResourceKind::Network, "vpc");

        assert!(graph.set_phase(&vpc, LifecyclePhase::Applied));
        assert_eq!(graph.get(&vpc).map(ResourceNode::phase), Some(LifecyclePhase::Applied));
        assert!(!graph.set_phase(&id(ResourceKind::Network, "nope"), LifecyclePhase::Failed));
    }
}
