// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative, dependency-ordered and reconcilable provisioning engine for
//! managed Kubernetes clusters and their supporting cloud resources.
//!
//! ## Overview
//!
//! Converge reads a YAML document describing the desired infrastructure, and:
//!
//! - Builds a dependency graph of typed resources
//! - Computes a plan against the last-applied state
//! - Executes the plan with bounded concurrency, retries and failure isolation
//! - Records every applied resource so the next run only does what changed
//!
//! ## Architecture
//!
//! 1. **Desired State**: `converge.yaml`, expanded into a [`graph::ResourceGraph`]
//! 2. **Recorded State**: [`state::StateRecord`]s in a local directory or S3
//! 3. **Observed State**: described through a [`provider::ProviderAdapter`]
//! 4. **Reconciler**: plans, executes and records under a run lock
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation and blueprint expansion
//! - [`graph`]: Resource identifiers, attributes and dependency ordering
//! - [`planner`]: Attribute diffs, plans and the concurrent executor
//! - [`provider`]: Provider adapters (sandbox and HTTP) and retry policy
//! - [`state`]: State storage backends (local, S3, memory) and the run lock
//! - [`reconciler`]: Plan, apply, destroy and drift entry points
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: platform
//!   environment: dev
//!
//! cluster:
//!   name: main
//!   version: "1.29"
//!   node_group:
//!     name: workers
//!     instance_types: [m5.large]
//!     desired_size: 2
//!
//! resources:
//!   logs:
//!     kind: compute_template
//!     attributes:
//!       instance_type: t3.small
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, ConvergeConfig};
pub use error::{ConvergeError, Result};
pub use graph::{ResourceGraph, ResourceId, ResourceKind};
pub use planner::{Plan, PlanExecutor, Planner, RunResult};
pub use provider::{ProviderAdapter, ProviderRegistry};
pub use reconciler::{DriftReport, Reconciler};
pub use state::{LocalStateStore, S3StateStore, StateStore};
