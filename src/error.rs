//! Error types for the Converge provisioning engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! graph construction, configuration, state storage, provider calls,
//! planning, and reconciliation.

use std::path::PathBuf;
use thiserror::Error;

use crate::graph::ResourceId;

/// The main error type for the Converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider backend errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Resource graph construction and validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// A resource with the same identifier is already in the graph.
    #[error("Duplicate resource: {id}")]
    DuplicateResource {
        /// The duplicated identifier.
        id: ResourceId,
    },

    /// A dependency endpoint does not exist in the graph.
    #[error("Unknown resource: {id}{}", referenced_suffix(.referenced_by))]
    UnknownResource {
        /// The missing identifier.
        id: String,
        /// The resource that referenced it, if any.
        referenced_by: Option<ResourceId>,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency {
        /// Members of the cycle, first member repeated at the end.
        cycle: Vec<ResourceId>,
    },
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A declared resource uses a kind no adapter exists for.
    #[error("Unsupported resource kind '{kind}' for resource '{resource}'")]
    UnsupportedResourceKind {
        /// The unknown kind string.
        kind: String,
        /// The resource that declared it.
        resource: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A stored record could not be read or parsed.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The run lock is no longer held by this process.
    #[error("State lock {lock_id} is no longer held")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// Storage backend error (filesystem or S3).
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Stored record format version is not understood.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Failure reported by a provider adapter.
///
/// `retryable` tells the executor whether the call may be attempted again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Whether retrying the same call may succeed.
    pub retryable: bool,
    /// Human-readable cause.
    pub cause: String,
    /// HTTP status code, when the backend returned one.
    pub status: Option<u16>,
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A resource is targeted by incompatible operations.
    #[error("Plan conflict on {id}: {reason}")]
    PlanConflict {
        /// The conflicting resource.
        id: ResourceId,
        /// Why the declaration is ambiguous.
        reason: String,
    },

    /// Dependency resolution failed.
    #[error("Failed to resolve dependencies: {message}")]
    DependencyResolutionFailed {
        /// Description of the dependency issue.
        message: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// No adapter is registered for a resource kind.
    #[error("No provider adapter registered for kind '{kind}'")]
    MissingAdapter {
        /// The resource kind.
        kind: String,
    },

    /// Recorded state changed between planning and applying.
    #[error("State changed since the plan was computed (planned against {planned}, found {current}); plan again")]
    StalePlan {
        /// Fingerprint of the state the plan was computed from.
        planned: String,
        /// Fingerprint of the state found under the run lock.
        current: String,
    },
}

/// Result type alias for Converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

fn referenced_suffix(referenced_by: &Option<ResourceId>) -> String {
    referenced_by
        .as_ref()
        .map(|r| format!(" (referenced by {r})"))
        .unwrap_or_default()
}

fn format_cycle(cycle: &[ResourceId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cause)?;
        if self.retryable {
            write!(f, " (retryable)")?;
        }
        Ok(())
    }
}

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.retryable,
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns true for user and configuration errors that are raised
    /// before any provider call is made.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Graph(_)
                | Self::Plan(_)
                | Self::Config(
                    ConfigError::ValidationError { .. }
                        | ConfigError::UnsupportedResourceKind { .. }
                        | ConfigError::ParseError { .. }
                )
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an error the executor may retry.
    #[must_use]
    pub fn retryable(cause: impl Into<String>) -> Self {
        Self {
            retryable: true,
            cause: cause.into(),
            status: None,
        }
    }

    /// Creates an error that fails the action immediately.
    #[must_use]
    pub fn fatal(cause: impl Into<String>) -> Self {
        Self {
            retryable: false,
            cause: cause.into(),
            status: None,
        }
    }

    /// Creates a retryable error for a call that exceeded its deadline.
    #[must_use]
    pub fn timeout(operation: &str, secs: f64) -> Self {
        Self::retryable(format!("{operation} exceeded deadline of {secs:.1}s"))
    }

    /// Attaches the backend status code.
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Classifies an HTTP status code returned by a backend.
    #[must_use]
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let retryable = matches!(status, 408 | 409 | 429 | 500 | 502 | 503 | 504);
        Self {
            retryable,
            cause: format!("backend returned {status}: {body}"),
            status: Some(status),
        }
    }
}
