//! Configuration module for the provisioning engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.yaml`
//! - Validation of configuration values and the cluster blueprint
//! - Computing attribute hashes for change detection

mod blueprint;
mod hash;
mod parser;
mod spec;
mod validator;

pub use blueprint::{
    CapacityType, ClusterBlueprint, LaunchTemplateBlueprint, NetworkBlueprint, NewNetwork, NewRole,
    NodeGroupBlueprint, RoleBlueprint,
};
pub use hash::AttributeHasher;
pub use parser::{API_TOKEN_VAR, ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    ConvergeConfig, ExecutionConfig, ProjectConfig, ProviderBackend, ProviderConfig, ResourceDecl,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationResult};
