//! Configuration document types for the provisioning engine.
//!
//! This module defines the structs that map to `converge.yaml`. The document
//! fully describes the desired infrastructure and how a run should behave.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

use crate::error::{ConfigError, GraphError, Result};
use crate::graph::{Attributes, Ensure, ResourceGraph, ResourceId, ResourceKind, ResourceNode};
use crate::state::LOCK_EXPIRY_SECS;

use super::blueprint::ClusterBlueprint;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConvergeConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Provider backend configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Optional typed cluster blueprint, expanded into resources.
    #[serde(default)]
    pub cluster: Option<ClusterBlueprint>,
    /// Explicitly declared resources, keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDecl>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Provider backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which backend serves resource calls.
    #[serde(default)]
    pub backend: ProviderBackend,
    /// Base URL of the resource API (http backend).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Cloud account identifier embedded in handles.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Cloud region.
    #[serde(default = "default_region")]
    pub region: String,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

/// Provider backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    /// In-process simulated cloud.
    #[default]
    Sandbox,
    /// JSON resource API over HTTP.
    Http,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// Run lock lifetime between refreshes, in seconds.
    #[serde(default)]
    pub lock_ttl_secs: Option<u64>,
}

impl StateConfig {
    /// Run lock lifetime between refreshes.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl_secs
            .map_or(Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs()), Duration::from_secs)
    }
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of actions in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempt ceiling for retryable provider errors.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on the retry delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Deadline for a single provider call in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// How long to wait for a created resource to become visible.
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    /// Cancel every pending action after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
}

/// A resource declared in the `resources:` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Resource kind, e.g. `network` or `node_group`.
    pub kind: String,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Logical names of resources this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Present or declared for deletion.
    #[serde(default)]
    pub ensure: Ensure,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

fn default_account_id() -> String {
    String::from("000000000000")
}

fn default_region() -> String {
    String::from("us-east-1")
}

const fn default_provider_timeout() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_call_timeout() -> u64 {
    120
}

const fn default_visibility_timeout() -> u64 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: ProviderBackend::default(),
            endpoint: None,
            account_id: default_account_id(),
            region: default_region(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            call_timeout_secs: default_call_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
            fail_fast: false,
        }
    }
}

impl ExecutionConfig {
    /// Per-call deadline.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Visibility wait bound.
    #[must_use]
    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

impl ResourceDecl {
    /// Creates a declaration of the given kind.
    #[must_use]
    pub fn new(kind: ResourceKind, attributes: Attributes) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            attributes,
            depends_on: Vec::new(),
            ensure: Ensure::Present,
        }
    }

    /// Adds an explicit dependency by logical name.
    #[must_use]
    pub fn after(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Parses the declared kind.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedResourceKind` if no adapter exists for the kind.
    pub fn resource_kind(&self, name: &str) -> std::result::Result<ResourceKind, ConfigError> {
        self.kind
            .parse()
            .map_err(|kind| ConfigError::UnsupportedResourceKind {
                kind,
                resource: name.to_string(),
            })
    }
}

impl ConvergeConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Merges blueprint-generated and explicit resources.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a name is declared twice.
    pub fn declared_resources(&self) -> Result<BTreeMap<String, ResourceDecl>> {
        let mut declared = match &self.cluster {
            Some(blueprint) => blueprint.expand(&self.provider.account_id),
            None => BTreeMap::new(),
        };

        for (name, decl) in &self.resources {
            if declared.contains_key(name) {
                return Err(ConfigError::validation(
                    format!("Resource '{name}' is already generated by the cluster blueprint"),
                    format!("resources.{name}"),
                )
                .into());
            }
            declared.insert(name.clone(), decl.clone());
        }

        Ok(declared)
    }

    /// Builds and validates the resource graph.
    ///
    /// `depends_on` entries and `{ref: name}` attribute values both become
    /// dependency edges.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedResourceKind`, graph construction errors, or the
    /// first graph validation error.
    pub fn to_graph(&self) -> Result<ResourceGraph> {
        let declared = self.declared_resources()?;

        let mut ids: BTreeMap<&str, ResourceId> = BTreeMap::new();
        for (name, decl) in &declared {
            let kind = decl.resource_kind(name)?;
            ids.insert(name.as_str(), ResourceId::new(kind, name.clone()));
        }

        let mut graph = ResourceGraph::new();
        for (name, decl) in &declared {
            let id = ids[name.as_str()].clone();
            let mut node = ResourceNode::new(id, decl.attributes.clone());
            if decl.ensure == Ensure::Absent {
                node = node.absent();
            }
            graph.add_resource(node)?;
        }

        for (name, decl) in &declared {
            let from = &ids[name.as_str()];

            let mut targets: BTreeSet<&str> = decl.depends_on.iter().map(String::as_str).collect();
            for value in decl.attributes.values() {
                value.collect_refs(&mut targets);
            }

            for target in targets {
                let to = ids.get(target).ok_or_else(|| GraphError::UnknownResource {
                    id: target.to_string(),
                    referenced_by: Some(from.clone()),
                })?;
                graph.add_dependency(from, to)?;
            }
        }

        graph.validate()?;
        debug!("Built resource graph with {} resources", graph.len());
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttrValue;

    fn config(yaml: &str) -> ConvergeConfig {
        serde_yaml::from_str(yaml).expect("parse")
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = config("project:\n  name: demo\n");

        assert_eq!(cfg.project.environment, "dev");
        assert_eq!(cfg.provider.backend, ProviderBackend::Sandbox);
        assert_eq!(cfg.state.backend, StateBackend::Local);
        assert_eq!(cfg.execution.concurrency, 4);
        assert_eq!(cfg.execution.max_attempts, 5);
        assert!(!cfg.execution.fail_fast);
    }

    #[test]
    fn test_graph_from_references_and_depends_on() {
        let cfg = config(
            r"
project:
  name: demo
resources:
  vpc:
    kind: network
    attributes:
      cidr: 10.0.0.0/16
  main:
    kind: managed_cluster
    attributes:
      vpc_id: { ref: vpc }
  workers:
    kind: node_group
    depends_on: [main]
    attributes:
      disk_size: 100
",
        );

        let graph = cfg.to_graph().expect("graph");
        let workers = graph
            .get(&ResourceId::new(ResourceKind::NodeGroup, "workers"))
            .expect("workers");
        let main = graph
            .get(&ResourceId::new(ResourceKind::ManagedCluster, "main"))
            .expect("main");

        assert!(workers.dependencies.contains(&main.id));
        assert!(main
            .dependencies
            .contains(&ResourceId::new(ResourceKind::Network, "vpc")));
        assert_eq!(workers.attributes["disk_size"], AttrValue::Int(100));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let cfg = config(
            r"
project:
  name: demo
resources:
  bucket:
    kind: object_bucket
",
        );

        let err = cfg.to_graph().expect_err("unknown kind");
        assert!(err.is_validation());
        assert!(err.to_string().contains("object_bucket"));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let cfg = config(
            r"
project:
  name: demo
resources:
  main:
    kind: managed_cluster
    attributes:
      vpc_id: { ref: missing }
",
        );

        let err = cfg.to_graph().expect_err("dangling ref");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_cycle_rejected() {
        let cfg = config(
            r"
project:
  name: demo
resources:
  a:
    kind: network
    depends_on: [b]
  b:
    kind: network
    depends_on: [a]
",
        );

        let err = cfg.to_graph().expect_err("cycle");
        assert!(err.to_string().contains("Cyclic dependency"));
    }

    #[test]
    fn test_absent_resource_kept_in_graph() {
        let cfg = config(
            r"
project:
  name: demo
resources:
  old:
    kind: network
    ensure: absent
",
        );

        let graph = cfg.to_graph().expect("graph");
        let node = graph
            .get(&ResourceId::new(ResourceKind::Network, "old"))
            .expect("node");
        assert!(!node.is_present());
    }
}
