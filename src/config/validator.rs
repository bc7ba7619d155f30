//! Configuration validation.
//!
//! Checks the whole document before any provider call is made: names,
//! resource kinds, backend settings, executor tuning and the cluster
//! blueprint. All problems are collected, the first one is returned as error.

use crate::error::{ConfigError, ConvergeError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{ConvergeConfig, ExecutionConfig, ProviderBackend, ProviderConfig, StateBackend, StateConfig};

/// Validator for the declared document.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error. Unsupported kinds are reported as
    /// `UnsupportedResourceKind`.
    pub fn validate(&self, config: &ConvergeConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_resources(config, &mut result)?;

        if let Some(blueprint) = &config.cluster
            && let Err(e) = blueprint.check()
        {
            if let ConfigError::ValidationError { message, field } = e {
                result.errors.push(ValidationError {
                    field: field.unwrap_or_else(|| String::from("cluster")),
                    message,
                });
            } else {
                return Err(e.into());
            }
        }

        if config.cluster.is_none() && config.resources.is_empty() {
            result.warnings.push(String::from("No resources declared"));
        }

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    fn validate_project(config: &ConvergeConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if provider.backend == ProviderBackend::Http {
            match provider.endpoint.as_deref() {
                None | Some("") => result.errors.push(ValidationError {
                    field: String::from("provider.endpoint"),
                    message: String::from("An endpoint is required when using the http backend"),
                }),
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    result.errors.push(ValidationError {
                        field: String::from("provider.endpoint"),
                        message: format!("Endpoint '{url}' must be an http(s) URL"),
                    });
                }
                Some(_) => {}
            }
        }

        if provider.account_id.len() != 12 || !provider.account_id.chars().all(|c| c.is_ascii_digit()) {
            result.errors.push(ValidationError {
                field: String::from("provider.account_id"),
                message: format!("Account id '{}' must be 12 digits", provider.account_id),
            });
        }

        if provider.region.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("provider.region"),
                message: String::from("Region cannot be empty"),
            });
        }

        if provider.timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("provider.timeout_secs"),
                message: String::from("Timeout must be at least 1 second"),
            });
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {}
        }

        if state.lock_ttl_secs == Some(0) {
            result.errors.push(ValidationError {
                field: String::from("state.lock_ttl_secs"),
                message: String::from("Lock lifetime must be at least 1 second"),
            });
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.concurrency == 0 {
            result.errors.push(ValidationError {
                field: String::from("execution.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        }

        if execution.max_attempts == 0 {
            result.errors.push(ValidationError {
                field: String::from("execution.max_attempts"),
                message: String::from("At least one attempt is required"),
            });
        }

        if execution.initial_backoff_ms > execution.max_backoff_ms {
            result.errors.push(ValidationError {
                field: String::from("execution.initial_backoff_ms"),
                message: String::from("Initial backoff cannot exceed max_backoff_ms"),
            });
        }

        if execution.call_timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("execution.call_timeout_secs"),
                message: String::from("Call timeout must be at least 1 second"),
            });
        }

        if execution.max_attempts > 20 {
            result.warnings.push(format!(
                "execution.max_attempts: {} attempts is unusually high",
                execution.max_attempts
            ));
        }
    }

    fn validate_resources(config: &ConvergeConfig, result: &mut ValidationResult) -> Result<()> {
        let mut seen = HashSet::new();

        for (name, decl) in &config.resources {
            let prefix = format!("resources.{name}");

            if !is_valid_name(name) {
                result.errors.push(ValidationError {
                    field: prefix.clone(),
                    message: format!(
                        "Resource name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."
                    ),
                });
            }

            decl.resource_kind(name)?;

            for dep in &decl.depends_on {
                if dep == name {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.depends_on"),
                        message: format!("Resource '{name}' cannot depend on itself"),
                    });
                }
                if !seen.insert((name.as_str(), dep.as_str())) {
                    result.warnings.push(format!("{prefix}.depends_on: '{dep}' listed twice"));
                }
            }
        }

        Ok(())
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
