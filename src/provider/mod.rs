//! Provider adapters.
//!
//! Every resource kind is provisioned through a [`ProviderAdapter`]. Two
//! backends are available: an in-process [`SandboxCloud`] and a JSON
//! resource API reached over HTTP.

mod adapter;
mod http;
mod registry;
mod retry;
mod sandbox;

pub use adapter::{Observed, ProviderAdapter};
pub use http::HttpAdapter;
pub use registry::ProviderRegistry;
pub use retry::{Attempted, RetryPolicy};
pub use sandbox::{Operation, SandboxAdapter, SandboxCloud};

#[cfg(test)]
pub use adapter::MockProviderAdapter;

use std::time::Duration;

use crate::config::ProviderConfig;

/// Connection settings shared by the adapters of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Cloud account identifier.
    pub account_id: String,
    /// Cloud region.
    pub region: String,
    /// Base URL of the resource API.
    pub endpoint: Option<String>,
    /// HTTP request timeout.
    pub timeout: Duration,
    /// Bearer token for the resource API.
    pub api_token: Option<String>,
}

impl ProviderSettings {
    /// Builds settings from the provider section and an optional token.
    #[must_use]
    pub fn from_config(config: &ProviderConfig, api_token: Option<String>) -> Self {
        Self {
            account_id: config.account_id.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            api_token,
        }
    }

    /// Settings for a sandbox cloud.
    #[must_use]
    pub fn sandbox(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            endpoint: None,
            timeout: Duration::from_secs(30),
            api_token: None,
        }
    }
}
