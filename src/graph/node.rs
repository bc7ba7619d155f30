//! Resource identifiers, typed attribute values and graph nodes.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Desired or observed attributes of a resource, keyed by attribute name.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Kinds of resources the engine knows how to provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network with its subnets.
    Network,
    /// IAM role assumed by the cluster or its nodes.
    IdentityRole,
    /// EC2 launch template for worker nodes.
    ComputeTemplate,
    /// Managed Kubernetes control plane.
    ManagedCluster,
    /// Managed worker node group.
    NodeGroup,
    /// Policy attached to the load balancer controller role.
    LoadBalancerPolicy,
}

impl ResourceKind {
    /// Every supported kind.
    pub const ALL: [Self; 6] = [
        Self::Network,
        Self::IdentityRole,
        Self::ComputeTemplate,
        Self::ManagedCluster,
        Self::NodeGroup,
        Self::LoadBalancerPolicy,
    ];

    /// Returns the snake-case name used in documents and identifiers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::IdentityRole => "identity_role",
            Self::ComputeTemplate => "compute_template",
            Self::ManagedCluster => "managed_cluster",
            Self::NodeGroup => "node_group",
            Self::LoadBalancerPolicy => "load_balancer_policy",
        }
    }

    /// AWS service namespace used in handles of this kind.
    #[must_use]
    pub const fn service(self) -> &'static str {
        match self {
            Self::Network | Self::ComputeTemplate => "ec2",
            Self::IdentityRole | Self::LoadBalancerPolicy => "iam",
            Self::ManagedCluster | Self::NodeGroup => "eks",
        }
    }

    /// Resource type segment used in handles of this kind.
    #[must_use]
    pub const fn handle_type(self) -> &'static str {
        match self {
            Self::Network => "vpc",
            Self::IdentityRole => "role",
            Self::ComputeTemplate => "launch-template",
            Self::ManagedCluster => "cluster",
            Self::NodeGroup => "nodegroup",
            Self::LoadBalancerPolicy => "policy",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Unique identifier of a resource: its kind plus a logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Logical name, unique within the declared document.
    pub name: String,
}

impl ResourceId {
    /// Creates a new identifier.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// File-system and object-key safe form of the identifier.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}__{}", self.kind.as_str(), self.name)
    }

    /// Parses the form produced by [`ResourceId::storage_key`].
    #[must_use]
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (kind, name) = key.split_once("__")?;
        let kind = kind.parse().ok()?;
        Some(Self::new(kind, name))
    }
}

// Lexicographic on the rendered form, so tie-breaks read naturally in plans.
impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .as_str()
            .cmp(other.kind.as_str())
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <kind>/<name>, got '{s}'"))?;
        let kind = kind
            .parse()
            .map_err(|k| format!("unknown resource kind '{k}'"))?;
        if name.is_empty() {
            return Err(format!("empty resource name in '{s}'"));
        }
        Ok(Self::new(kind, name))
    }
}

/// Reference from one resource's attribute to another resource's handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttrRef {
    /// Logical name of the referenced resource.
    #[serde(rename = "ref")]
    pub target: String,
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    Str(String),
    /// Ordered list of values.
    List(Vec<AttrValue>),
    /// Reference to another resource, resolved to its handle at apply time.
    Ref(AttrRef),
    /// Nested mapping.
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    /// Creates a reference to the resource with the given logical name.
    #[must_use]
    pub fn reference(target: impl Into<String>) -> Self {
        Self::Ref(AttrRef {
            target: target.into(),
        })
    }

    /// Creates a list of strings.
    #[must_use]
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(items.into_iter().map(|s| Self::Str(s.into())).collect())
    }

    /// Returns the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Collects the logical names of every reference inside this value.
    pub fn collect_refs<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::Ref(r) => {
                out.insert(r.target.as_str());
            }
            Self::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Self::Map(map) => map.values().for_each(|v| v.collect_refs(out)),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) => {}
        }
    }

    /// Replaces every reference using the given resolver.
    ///
    /// # Errors
    ///
    /// Returns the name of the first reference the resolver cannot resolve.
    pub fn resolve_refs<F>(&self, resolve: &F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(match self {
            Self::Ref(r) => Self::Str(resolve(&r.target).ok_or_else(|| r.target.clone())?),
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|v| v.resolve_refs(resolve))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve_refs(resolve)?)))
                    .collect::<Result<_, String>>()?,
            ),
            other => other.clone(),
        })
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Ref(r) => write!(f, "ref({})", r.target),
            Self::List(_) | Self::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for AttrValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Whether a declared resource should exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    /// The resource should exist with the declared attributes.
    #[default]
    Present,
    /// The resource is declared for deletion.
    Absent,
}

/// Lifecycle phase of a node during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    /// Declared, not yet considered by a run.
    #[default]
    Pending,
    /// Has an action queued in the current plan.
    Planned,
    /// A provider call for this node is in flight.
    Applying,
    /// Converged to the declared attributes.
    Applied,
    /// The last action on this node failed.
    Failed,
    /// Removed from the backend.
    Destroyed,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planned => "planned",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// A declared resource in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Unique identifier.
    pub id: ResourceId,
    /// Desired attributes.
    pub attributes: Attributes,
    /// Identifiers this resource depends on.
    pub dependencies: BTreeSet<ResourceId>,
    /// Present or declared for deletion.
    pub ensure: Ensure,
    phase: LifecyclePhase,
}

impl ResourceNode {
    /// Creates a new node with no dependencies.
    #[must_use]
    pub fn new(id: ResourceId, attributes: Attributes) -> Self {
        Self {
            id,
            attributes,
            dependencies: BTreeSet::new(),
            ensure: Ensure::Present,
            phase: LifecyclePhase::Pending,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: ResourceId) -> Self {
        self.dependencies.insert(id);
        self
    }

    /// Marks the node as declared for deletion.
    #[must_use]
    pub const fn absent(mut self) -> Self {
        self.ensure = Ensure::Absent;
        self
    }

    /// Sets a single attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub(crate) const fn set_phase(&mut self, phase: LifecyclePhase) {
        self.phase = phase;
    }

    /// Returns true if the node is declared present.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.ensure == Ensure::Present
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_roundtrips_through_display() {
        let id = ResourceId::new(ResourceKind::NodeGroup, "default");
        assert_eq!(id.to_string(), "node_group/default");
        assert_eq!("node_group/default".parse::<ResourceId>(), Ok(id.clone()));
        assert_eq!(ResourceId::from_storage_key(&id.storage_key()), Some(id));
    }

    #[test]
    fn test_identifier_rejects_unknown_kind() {
        assert!("bucket/x".parse::<ResourceId>().is_err());
        assert!("network/".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_identifier_order_is_lexicographic() {
        let a = ResourceId::new(ResourceKind::NodeGroup, "a");
        let b = ResourceId::new(ResourceKind::Network, "z");
        // "network" < "node_group"
        assert!(b < a);
    }

    #[test]
    fn test_attr_value_parses_reference_and_map() {
        let yaml = "vpc: { ref: main }\ntags: { team: ml }\nsize: 100\nratio: 0.5\n";
        let attrs: Attributes = serde_yaml::from_str(yaml).expect("parse");

        assert_eq!(attrs["vpc"], AttrValue::reference("main"));
        assert!(matches!(attrs["tags"], AttrValue::Map(_)));
        assert_eq!(attrs["size"], AttrValue::Int(100));
        assert_eq!(attrs["ratio"], AttrValue::Float(0.5));
    }

    #[test]
    fn test_resolve_refs_replaces_nested_references() {
        let value = AttrValue::List(vec![
            AttrValue::reference("a"),
            AttrValue::Map(BTreeMap::from([(
                String::from("inner"),
                AttrValue::reference("b"),
            )])),
        ]);

        let resolved = value
            .resolve_refs(&|name: &str| Some(format!("handle-{name}")))
            .expect("resolve");
        let mut refs = BTreeSet::new();
        resolved.collect_refs(&mut refs);

        assert!(refs.is_empty());
        assert_eq!(
            resolved.to_string(),
            r#"["handle-a",{"inner":"handle-b"}]"#
        );
    }

    #[test]
    fn test_resolve_refs_reports_missing_target() {
        let value = AttrValue::reference("ghost");
        assert_eq!(value.resolve_refs(&|_: &str| None), Err(String::from("ghost")));
    }
}
