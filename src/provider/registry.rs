//! Kind to adapter lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ReconcileError, Result};
use crate::graph::ResourceKind;

use super::ProviderSettings;
use super::adapter::ProviderAdapter;
use super::http::HttpAdapter;
use super::sandbox::SandboxCloud;

/// Adapters indexed by the kind they serve.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ResourceKind, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ProviderRegistry").field("kinds", &kinds).finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under the kind it reports, replacing any
    /// previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Returns the adapter for a kind.
    ///
    /// # Errors
    ///
    /// Returns `MissingAdapter` if nothing serves the kind.
    pub fn get(&self, kind: ResourceKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned().ok_or_else(|| {
            ReconcileError::MissingAdapter {
                kind: kind.to_string(),
            }
            .into()
        })
    }

    /// Returns true if an adapter serves the kind.
    #[must_use]
    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.adapters.contains_key(&kind)
    }

    /// Registry serving every kind from one sandbox cloud.
    #[must_use]
    pub fn sandbox(cloud: &Arc<SandboxCloud>) -> Self {
        ResourceKind::ALL
            .iter()
            .fold(Self::new(), |registry, kind| {
                registry.with(Arc::new(cloud.adapter(*kind)))
            })
    }

    /// Registry serving every kind from the HTTP resource API.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured or the HTTP client
    /// cannot be built.
    pub fn http(settings: &ProviderSettings) -> Result<Self> {
        let mut registry = Self::new();
        for kind in ResourceKind::ALL {
            registry.register(Arc::new(HttpAdapter::new(kind, settings)?));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;

    #[test]
    fn test_sandbox_registry_serves_every_kind() {
        let cloud = Arc::new(SandboxCloud::new(ProviderSettings::sandbox("000000000000", "us-east-1")));
        let registry = ProviderRegistry::sandbox(&cloud);

        for kind in ResourceKind::ALL {
            let adapter = registry.get(kind).expect("adapter");
            assert_eq!(adapter.kind(), kind);
        }
    }

    #[test]
    fn test_debug_lists_sorted_kinds() {
        let cloud = Arc::new(SandboxCloud::new(ProviderSettings::sandbox("000000000000", "us-east-1")));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(cloud.adapter(ResourceKind::NodeGroup)));
        registry.register(Arc::new(cloud.adapter(ResourceKind::Network)));

        assert_eq!(
            format!("{registry:?}"),
            r#"ProviderRegistry { kinds: ["network", "node_group"] }"#
        );
    }

    #[test]
    fn test_missing_adapter() {
        let registry = ProviderRegistry::new();
        let err = registry.get(ResourceKind::NodeGroup).err().expect("missing");
        assert!(matches!(
            err,
            ConvergeError::Reconcile(ReconcileError::MissingAdapter { ref kind }) if kind == "node_group"
        ));
        assert!(!registry.contains(ResourceKind::NodeGroup));
    }

    #[test]
    fn test_http_registry_requires_endpoint() {
        let settings = ProviderSettings::sandbox("000000000000", "us-east-1");
        assert!(ProviderRegistry::http(&settings).is_err());
    }
}
