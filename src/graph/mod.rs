//! Resource graph: identifiers, typed attributes and dependency ordering.

mod dag;
mod node;

pub use dag::{ResourceGraph, TopologicalOrder};
pub use node::{
    AttrRef, AttrValue, Attributes, Ensure, LifecyclePhase, ResourceId, ResourceKind, ResourceNode,
};
