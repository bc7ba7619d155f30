//! The adapter interface every resource kind is provisioned through.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceId, ResourceKind};
use crate::planner::AttributeDiff;

/// Result of describing a handle.
///
/// `NotFound` is a normal answer, not an error: the resource was deleted
/// out-of-band or is not visible yet.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    /// The resource exists with these attributes.
    Found(Attributes),
    /// No resource behind the handle.
    NotFound,
}

impl Observed {
    /// Returns the attributes if the resource was found.
    #[must_use]
    pub const fn attributes(&self) -> Option<&Attributes> {
        match self {
            Self::Found(attrs) => Some(attrs),
            Self::NotFound => None,
        }
    }
}

/// Create/read/update/delete access to one resource kind.
///
/// Implementations are eventually consistent: a handle returned by `create`
/// may describe as `NotFound` for a short while.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Resource kind served by this adapter.
    fn kind(&self) -> ResourceKind;

    /// Reads the current attributes behind a handle.
    async fn describe(&self, handle: &str) -> Result<Observed, ProviderError>;

    /// Creates a resource and returns its handle.
    ///
    /// `client_token` is the same for every retry of one create. A backend
    /// that already accepted the token returns the existing handle instead of
    /// creating a second resource.
    async fn create(
        &self,
        id: &ResourceId,
        desired: &Attributes,
        client_token: &str,
    ) -> Result<String, ProviderError>;

    /// Applies an incremental change. `desired` is the full target state.
    async fn update(
        &self,
        handle: &str,
        diff: &AttributeDiff,
        desired: &Attributes,
    ) -> Result<(), ProviderError>;

    /// Deletes a resource. Deleting a missing resource succeeds.
    async fn delete(&self, handle: &str) -> Result<(), ProviderError>;
}
