//! Typed cluster blueprint.
//!
//! A blueprint describes a managed Kubernetes cluster with its network, IAM
//! roles, worker launch template, node group, and the load balancer
//! controller's `AddTags` permission. It is validated once at load time and
//! expanded into ordinary resource declarations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::error::ConfigError;
use crate::graph::{AttrValue, Attributes, ResourceKind};

use super::spec::ResourceDecl;

/// Logical name of the generated cluster admin role.
pub const ADMIN_ROLE_NAME: &str = "cluster-admin";
/// Logical name of the generated worker node role.
pub const NODE_ROLE_NAME: &str = "default-node";
/// Logical name of the generated network.
pub const NETWORK_NAME: &str = "vpc";
/// Logical name of the generated load balancer policy.
pub const ALB_POLICY_NAME: &str = "alb-add-tags";

/// Typed description of a managed cluster and its supporting resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ClusterBlueprint {
    /// Cluster name.
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    /// Kubernetes version, e.g. `1.29`.
    #[validate(length(min = 1))]
    pub version: String,
    /// Network to create or reuse.
    #[serde(default)]
    pub network: NetworkBlueprint,
    /// Role mapped to cluster administrators.
    #[serde(default = "RoleBlueprint::default_admin")]
    pub admin_role: RoleBlueprint,
    /// Role assumed by worker nodes.
    #[serde(default = "RoleBlueprint::default_node")]
    pub node_role: RoleBlueprint,
    /// Worker launch template.
    #[serde(default)]
    pub launch_template: Option<LaunchTemplateBlueprint>,
    /// Managed node group; no group is created when omitted.
    #[serde(default)]
    pub node_group: Option<NodeGroupBlueprint>,
    /// Attach the `AddTags` permission for the load balancer controller.
    #[serde(default = "default_true")]
    pub alb_add_tags_policy: bool,
}

/// Network source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum NetworkBlueprint {
    /// Create a new network.
    Create(NewNetwork),
    /// Reuse an existing network.
    Existing {
        /// Identifier of the existing network.
        vpc_id: String,
    },
}

/// Parameters of a network to create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct NewNetwork {
    /// Address range of the network.
    #[serde(default = "default_cidr")]
    #[validate(length(min = 9, max = 18))]
    pub cidr: String,
    /// Number of availability zones.
    #[serde(default = "default_max_azs")]
    #[validate(range(min = 1, max = 6))]
    pub max_azs: u8,
    /// Prefix length of the public subnets.
    #[serde(default = "default_public_mask")]
    #[validate(range(min = 16, max = 28))]
    pub public_subnet_mask: u8,
    /// Prefix length of the private subnets.
    #[serde(default = "default_private_mask")]
    #[validate(range(min = 16, max = 28))]
    pub private_subnet_mask: u8,
}

/// IAM role source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RoleBlueprint {
    /// Create a new role.
    Create(NewRole),
    /// Reuse an existing role by name.
    Existing {
        /// Name of the existing role.
        role_name: String,
    },
}

/// Parameters of a role to create.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRole {
    /// AWS managed policy names to attach.
    #[serde(default)]
    pub managed_policies: Vec<String>,
    /// Actions granted by an inline policy on all resources.
    #[serde(default)]
    pub inline_actions: Vec<String>,
}

/// Launch template for worker nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct LaunchTemplateBlueprint {
    /// Logical and template name.
    #[serde(default = "default_template_name")]
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    /// Instance type.
    #[validate(length(min = 1))]
    pub instance_type: String,
    /// Root volume size in GiB.
    #[serde(default = "default_disk_size")]
    #[validate(range(min = 8, max = 16384))]
    pub disk_size: u32,
    /// Provisioned IOPS of the root volume.
    #[serde(default = "default_iops")]
    #[validate(range(min = 100, max = 256000))]
    pub iops: u32,
    /// Enable Nitro enclaves.
    #[serde(default = "default_true")]
    pub enclave: bool,
}

/// Managed node group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct NodeGroupBlueprint {
    /// Logical and node group name.
    #[serde(default = "default_node_group_name")]
    #[validate(length(min = 1, max = 63))]
    pub name: String,
    /// Spot or on-demand capacity.
    #[serde(default)]
    pub capacity_type: CapacityType,
    /// Candidate instance types.
    #[validate(length(min = 1))]
    pub instance_types: Vec<String>,
    /// Desired node count.
    #[serde(default = "default_desired")]
    pub desired_size: u32,
    /// Minimum node count.
    #[serde(default)]
    pub min_size: u32,
    /// Maximum node count.
    #[serde(default = "default_max_size")]
    #[validate(range(min = 1, max = 450))]
    pub max_size: u32,
    /// Node disk size in GiB.
    #[serde(default = "default_disk_size")]
    #[validate(range(min = 1, max = 16384))]
    pub disk_size: u32,
    /// AMI release version, latest when omitted.
    #[serde(default)]
    pub release_version: Option<String>,
}

/// Node group capacity types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityType {
    /// On-demand instances.
    #[default]
    OnDemand,
    /// Spot instances.
    Spot,
}

impl CapacityType {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnDemand => "ON_DEMAND",
            Self::Spot => "SPOT",
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_cidr() -> String {
    String::from("10.0.0.0/16")
}

const fn default_max_azs() -> u8 {
    2
}

const fn default_public_mask() -> u8 {
    26
}

const fn default_private_mask() -> u8 {
    24
}

fn default_template_name() -> String {
    String::from("ray-node-launch-template")
}

const fn default_disk_size() -> u32 {
    100
}

const fn default_iops() -> u32 {
    3000
}

fn default_node_group_name() -> String {
    String::from("cluster-default-ng")
}

const fn default_desired() -> u32 {
    2
}

const fn default_max_size() -> u32 {
    4
}

impl Default for NetworkBlueprint {
    fn default() -> Self {
        Self::Create(NewNetwork::default())
    }
}

impl Default for NewNetwork {
    fn default() -> Self {
        Self {
            cidr: default_cidr(),
            max_azs: default_max_azs(),
            public_subnet_mask: default_public_mask(),
            private_subnet_mask: default_private_mask(),
        }
    }
}

impl RoleBlueprint {
    fn default_admin() -> Self {
        Self::Create(NewRole {
            managed_policies: Vec::new(),
            inline_actions: vec![String::from("eks:DescribeCluster")],
        })
    }

    fn default_node() -> Self {
        Self::Create(NewRole {
            managed_policies: vec![
                String::from("AmazonEKSWorkerNodePolicy"),
                String::from("AmazonEC2ContainerRegistryReadOnly"),
                String::from("AmazonEKS_CNI_Policy"),
            ],
            inline_actions: Vec::new(),
        })
    }
}

impl ClusterBlueprint {
    /// Runs every field check, including nested sections.
    ///
    /// # Errors
    ///
    /// Returns the first failing section as a validation error.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::validation(e.to_string(), "cluster"))?;

        if let NetworkBlueprint::Create(network) = &self.network {
            network
                .validate()
                .map_err(|e| ConfigError::validation(e.to_string(), "cluster.network"))?;
            if network.cidr.parse::<std::net::Ipv4Addr>().is_ok() || !network.cidr.contains('/') {
                return Err(ConfigError::validation(
                    format!("'{}' is not a CIDR block", network.cidr),
                    "cluster.network.cidr",
                ));
            }
        }
        if let NetworkBlueprint::Existing { vpc_id } = &self.network
            && vpc_id.is_empty()
        {
            return Err(ConfigError::validation("vpc_id cannot be empty", "cluster.network.vpc_id"));
        }

        for (field, role) in [("cluster.admin_role", &self.admin_role), ("cluster.node_role", &self.node_role)] {
            if let RoleBlueprint::Existing { role_name } = role
                && role_name.is_empty()
            {
                return Err(ConfigError::validation("role_name cannot be empty", field));
            }
        }

        if let Some(template) = &self.launch_template {
            template
                .validate()
                .map_err(|e| ConfigError::validation(e.to_string(), "cluster.launch_template"))?;
        }

        if let Some(group) = &self.node_group {
            group
                .validate()
                .map_err(|e| ConfigError::validation(e.to_string(), "cluster.node_group"))?;
            if group.min_size > group.desired_size || group.desired_size > group.max_size {
                return Err(ConfigError::validation(
                    format!(
                        "node group sizes must satisfy min <= desired <= max (got {} / {} / {})",
                        group.min_size, group.desired_size, group.max_size
                    ),
                    "cluster.node_group",
                ));
            }
        }

        Ok(())
    }

    /// Expands the blueprint into resource declarations.
    ///
    /// Reused roles and networks do not become resources; their identifiers
    /// are written as literal attributes of the resources that use them.
    #[must_use]
    pub fn expand(&self, account_id: &str) -> BTreeMap<String, ResourceDecl> {
        let mut out = BTreeMap::new();

        let admin_role = self.role_value(&self.admin_role, ADMIN_ROLE_NAME, account_id, &mut out);
        let node_role = self.role_value(&self.node_role, NODE_ROLE_NAME, account_id, &mut out);

        let vpc = match &self.network {
            NetworkBlueprint::Create(network) => {
                let tag = format!("kubernetes.io/cluster/{}", self.name);
                let mut attrs = Attributes::new();
                attrs.insert("cidr".into(), network.cidr.clone().into());
                attrs.insert("max_azs".into(), AttrValue::Int(i64::from(network.max_azs)));
                attrs.insert(
                    "subnets".into(),
                    AttrValue::List(vec![
                        subnet("Public", "public", network.public_subnet_mask),
                        subnet("Private", "private_with_egress", network.private_subnet_mask),
                    ]),
                );
                attrs.insert(
                    "subnet_tags".into(),
                    AttrValue::Map(BTreeMap::from([(tag, AttrValue::from("shared"))])),
                );
                out.insert(NETWORK_NAME.to_string(), ResourceDecl::new(ResourceKind::Network, attrs));
                AttrValue::reference(NETWORK_NAME)
            }
            NetworkBlueprint::Existing { vpc_id } => AttrValue::from(vpc_id.clone()),
        };

        if let Some(template) = &self.launch_template {
            let mut attrs = Attributes::new();
            attrs.insert("template_name".into(), template.name.clone().into());
            attrs.insert("instance_type".into(), template.instance_type.clone().into());
            attrs.insert("enclave_enabled".into(), template.enclave.into());
            attrs.insert(
                "block_device".into(),
                AttrValue::Map(BTreeMap::from([
                    (String::from("device_name"), AttrValue::from("/dev/xvda")),
                    (String::from("volume_type"), AttrValue::from("io2")),
                    (String::from("volume_size"), AttrValue::from(template.disk_size)),
                    (String::from("iops"), AttrValue::from(template.iops)),
                    (String::from("delete_on_termination"), AttrValue::Bool(true)),
                    (String::from("encrypted"), AttrValue::Bool(false)),
                ])),
            );
            attrs.insert(
                "metadata_options".into(),
                AttrValue::Map(BTreeMap::from([
                    (String::from("http_put_response_hop_limit"), AttrValue::Int(1)),
                    (String::from("http_tokens"), AttrValue::from("required")),
                ])),
            );
            out.insert(
                template.name.clone(),
                ResourceDecl::new(ResourceKind::ComputeTemplate, attrs),
            );
        }

        let mut cluster = Attributes::new();
        cluster.insert("cluster_name".into(), self.name.clone().into());
        cluster.insert("version".into(), self.version.clone().into());
        cluster.insert("endpoint_access".into(), "public_and_private".into());
        cluster.insert("default_capacity".into(), AttrValue::Int(0));
        cluster.insert("vpc_id".into(), vpc);
        cluster.insert("masters_role_arn".into(), admin_role);
        out.insert(
            self.name.clone(),
            ResourceDecl::new(ResourceKind::ManagedCluster, cluster),
        );

        if self.alb_add_tags_policy {
            out.insert(ALB_POLICY_NAME.to_string(), self.alb_policy());
        }

        if let Some(group) = &self.node_group {
            let mut attrs = Attributes::new();
            attrs.insert("nodegroup_name".into(), group.name.clone().into());
            attrs.insert("cluster".into(), AttrValue::reference(&self.name));
            attrs.insert("node_role_arn".into(), node_role);
            attrs.insert("capacity_type".into(), group.capacity_type.as_str().into());
            attrs.insert("instance_types".into(), AttrValue::strings(group.instance_types.iter().cloned()));
            attrs.insert("desired_size".into(), group.desired_size.into());
            attrs.insert("min_size".into(), group.min_size.into());
            attrs.insert("max_size".into(), group.max_size.into());
            attrs.insert("disk_size".into(), group.disk_size.into());
            attrs.insert("force_update".into(), false.into());
            if let Some(release) = &group.release_version {
                attrs.insert("release_version".into(), release.clone().into());
            }
            if let Some(template) = &self.launch_template {
                attrs.insert("launch_template".into(), AttrValue::reference(&template.name));
            }
            out.insert(group.name.clone(), ResourceDecl::new(ResourceKind::NodeGroup, attrs));
        }

        out
    }

    fn role_value(
        &self,
        role: &RoleBlueprint,
        name: &str,
        account_id: &str,
        out: &mut BTreeMap<String, ResourceDecl>,
    ) -> AttrValue {
        match role {
            RoleBlueprint::Create(spec) => {
                let mut attrs = Attributes::new();
                attrs.insert("role_name".into(), format!("{}-{name}", self.name).into());
                attrs.insert(
                    "assumed_by".into(),
                    AttrValue::strings(["account-root", "ec2.amazonaws.com"]),
                );
                attrs.insert("managed_policies".into(), AttrValue::strings(spec.managed_policies.iter().cloned()));
                attrs.insert("inline_actions".into(), AttrValue::strings(spec.inline_actions.iter().cloned()));
                out.insert(name.to_string(), ResourceDecl::new(ResourceKind::IdentityRole, attrs));
                AttrValue::reference(name)
            }
            RoleBlueprint::Existing { role_name } => {
                AttrValue::from(format!("arn:aws:iam::{account_id}:role/{role_name}"))
            }
        }
    }

    fn alb_policy(&self) -> ResourceDecl {
        let mut attrs = Attributes::new();
        attrs.insert("cluster".into(), AttrValue::reference(&self.name));
        attrs.insert("service_account".into(), "kube-system/aws-load-balancer-controller".into());
        attrs.insert("actions".into(), AttrValue::strings(["elasticloadbalancing:AddTags"]));
        attrs.insert(
            "resources".into(),
            AttrValue::strings([
                "arn:aws:elasticloadbalancing:*:*:targetgroup/*/*",
                "arn:aws:elasticloadbalancing:*:*:loadbalancer/net/*/*",
                "arn:aws:elasticloadbalancing:*:*:loadbalancer/app/*/*",
            ]),
        );
        attrs.insert(
            "conditions".into(),
            AttrValue::Map(BTreeMap::from([
                (
                    String::from("StringEquals"),
                    AttrValue::Map(BTreeMap::from([(
                        String::from("elasticloadbalancing:CreateAction"),
                        AttrValue::strings(["CreateTargetGroup", "CreateLoadBalancer"]),
                    )])),
                ),
                (
                    String::from("Null"),
                    AttrValue::Map(BTreeMap::from([(
                        String::from("aws:RequestTag/elbv2.k8s.aws/cluster"),
                        AttrValue::from("false"),
                    )])),
                ),
            ])),
        );
        ResourceDecl::new(ResourceKind::LoadBalancerPolicy, attrs)
    }
}

fn subnet(name: &str, subnet_type: &str, mask: u8) -> AttrValue {
    AttrValue::Map(BTreeMap::from([
        (String::from("name"), AttrValue::from(name)),
        (String::from("type"), AttrValue::from(subnet_type)),
        (String::from("cidr_mask"), AttrValue::Int(i64::from(mask))),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blueprint(yaml: &str) -> ClusterBlueprint {
        serde_yaml::from_str(yaml).expect("parse blueprint")
    }

    const FULL: &str = r"
name: ray
version: '1.29'
launch_template:
  instance_type: m5.2xlarge
  disk_size: 200
  iops: 5000
node_group:
  capacity_type: SPOT
  instance_types: [m5.xlarge, m5.2xlarge]
  desired_size: 2
  min_size: 1
  max_size: 4
";

    #[test]
    fn test_full_blueprint_expands_every_resource() {
        let bp = blueprint(FULL);
        bp.check().expect("valid");

        let resources = bp.expand("123456789012");
        let names: Vec<&str> = resources.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                ALB_POLICY_NAME,
                ADMIN_ROLE_NAME,
                "cluster-default-ng",
                NODE_ROLE_NAME,
                "ray",
                "ray-node-launch-template",
                NETWORK_NAME,
            ]
        );

        let group = &resources["cluster-default-ng"];
        assert_eq!(group.kind, "node_group");
        assert_eq!(group.attributes["capacity_type"], AttrValue::from("SPOT"));
        assert_eq!(group.attributes["cluster"], AttrValue::reference("ray"));
        assert_eq!(group.attributes["node_role_arn"], AttrValue::reference(NODE_ROLE_NAME));
    }

    #[test]
    fn test_existing_role_and_network_become_literals() {
        let bp = blueprint(
            r"
name: ray
version: '1.29'
network:
  source: existing
  vpc_id: vpc-0abc
admin_role:
  source: existing
  role_name: Admin
",
        );
        bp.check().expect("valid");

        let resources = bp.expand("123456789012");
        assert!(!resources.contains_key(NETWORK_NAME));
        assert!(!resources.contains_key(ADMIN_ROLE_NAME));

        let cluster = &resources["ray"];
        assert_eq!(cluster.attributes["vpc_id"], AttrValue::from("vpc-0abc"));
        assert_eq!(
            cluster.attributes["masters_role_arn"],
            AttrValue::from("arn:aws:iam::123456789012:role/Admin")
        );
    }

    #[test]
    fn test_alb_policy_depends_on_cluster() {
        let resources = blueprint(FULL).expand("123456789012");
        let policy = &resources[ALB_POLICY_NAME];

        assert_eq!(policy.kind, "load_balancer_policy");
        assert_eq!(policy.attributes["cluster"], AttrValue::reference("ray"));
        assert_eq!(
            policy.attributes["actions"],
            AttrValue::strings(["elasticloadbalancing:AddTags"])
        );
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let mut bp = blueprint(FULL);
        if let Some(group) = bp.node_group.as_mut() {
            group.min_size = 5;
        }
        assert!(bp.check().is_err());
    }

    #[test]
    fn test_invalid_iops_rejected() {
        let mut bp = blueprint(FULL);
        if let Some(template) = bp.launch_template.as_mut() {
            template.iops = 10;
        }
        assert!(bp.check().is_err());
    }

    #[test]
    fn test_unknown_capacity_type_fails_to_parse() {
        let result: Result<ClusterBlueprint, _> = serde_yaml::from_str(
            "name: ray\nversion: '1.29'\nnode_group:\n  capacity_type: RESERVED\n  instance_types: [m5.large]\n",
        );
        assert!(result.is_err());
    }
}
