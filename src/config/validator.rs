//! Configuration validation for deployment configs.
//!
//! Collects every problem in one pass so that `envdeploy validate` can report
//! them all. Checks that need providers (type schemas) live in the planner.

use crate::error::{ConfigError, DeployError, Result};
use crate::graph::ResourceGraph;
use crate::state::validate_environment_name;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;
use validator::Validate;

use super::spec::{DeployConfig, EnvironmentConfig, ProviderType};

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default, serde::Serialize)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Clone, serde::Serialize)]
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

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found, if any.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config, None);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(DeployError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects all errors and warnings, optionally for one environment only.
    #[must_use]
    pub fn check(&self, config: &DeployConfig, environment: Option<&str>) -> ValidationResult {
        let mut result = ValidationResult::default();

        result.collect("", config.validate());
        result.collect("state.", config.state.validate());
        result.collect("defaults.", config.defaults.validate());

        Self::validate_providers(config, &mut result);

        if config.environments.is_empty() {
            result.push("environments", "No environments defined");
        }

        let mut used_providers = BTreeSet::new();
        for (name, env) in &config.environments {
            if environment.is_some_and(|only| only != name) {
                continue;
            }
            Self::validate_environment(config, name, env, &mut used_providers, &mut result);
        }

        if let Some(only) = environment {
            if !config.environments.contains_key(only) {
                result.push("environments", format!("Environment '{only}' is not defined"));
            }
        } else {
            for provider in config.providers.keys() {
                if !used_providers.contains(provider.as_str()) {
                    result.warnings.push(format!("providers.{provider}: Provider is never used"));
                }
            }
        }

        result
    }

    /// Validates provider instance settings.
    fn validate_providers(config: &DeployConfig, result: &mut ValidationResult) {
        for (name, provider) in &config.providers {
            let prefix = format!("providers.{name}");

            if provider.provider_type == ProviderType::Http {
                match provider.properties.get("endpoint").and_then(|v| v.as_str()) {
                    Some(endpoint) if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {}
                    Some(endpoint) => result.push(
                        format!("{prefix}.properties.endpoint"),
                        format!("Endpoint '{endpoint}' must be an http(s) URL"),
                    ),
                    None => result.push(
                        format!("{prefix}.properties.endpoint"),
                        "http providers require an endpoint",
                    ),
                }
            }
        }
    }

    /// Validates one environment.
    fn validate_environment<'a>(
        config: &'a DeployConfig,
        name: &str,
        env: &'a EnvironmentConfig,
        used_providers: &mut BTreeSet<&'a str>,
        result: &mut ValidationResult,
    ) {
        let prefix = format!("environments.{name}");

        if validate_environment_name(name).is_err() {
            result.push(
                prefix.clone(),
                format!("Environment name '{name}' may only use letters, digits, '-', '_' and '.'"),
            );
        }

        if env.resources.is_empty() {
            result.warnings.push(format!("{prefix}: No resources defined"));
        }

        let mut seen_names = HashSet::new();
        for (i, resource) in env.resources.iter().enumerate() {
            let field = format!("{prefix}.resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.push(
                    format!("{field}.name"),
                    ConfigError::DuplicateName {
                        environment: name.to_string(),
                        name: resource.name.clone(),
                    }
                    .to_string(),
                );
            }

            if !is_valid_name(&resource.name) {
                result.push(
                    format!("{field}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens or underscores.",
                        resource.name
                    ),
                );
            }

            result.collect(&format!("{field}."), resource.validate());

            match resource.provider.as_deref().or(env.provider.as_deref()) {
                Some(provider) if config.providers.contains_key(provider) => {
                    if let Some((key, _)) = config.providers.get_key_value(provider) {
                        used_providers.insert(key.as_str());
                    }
                }
                Some(provider) => result.push(
                    format!("{field}.provider"),
                    format!("Provider '{provider}' is not configured"),
                ),
                None => result.push(
                    format!("{field}.provider"),
                    format!("Resource '{}' has no provider binding", resource.name),
                ),
            }
        }

        // Templates and provider bindings resolve as a whole
        let specs = match config.environment(name) {
            Ok(resolved) => resolved.resources,
            Err(ConfigError::ValidationError { .. }) => return,
            Err(e) => {
                result.push(prefix, e.to_string());
                return;
            }
        };

        if let Err(e) = ResourceGraph::check_references(&specs) {
            result.push(format!("{prefix}.resources"), e.to_string());
            return;
        }

        if let Err(e) = ResourceGraph::new(&specs).build_order() {
            result.push(format!("{prefix}.resources"), e.to_string());
        }
    }
}

fn describe(error: &validator::ValidationError) -> String {
    error
        .message
        .as_ref()
        .map_or_else(|| format!("failed '{}' check", error.code), ToString::to_string)
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens or underscores, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    // Rest must be lowercase alphanumeric, hyphen or underscore
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_') {
        return false;
    }

    // Cannot end with a separator
    !name.ends_with('-') && !name.ends_with('_')
}

impl ValidationResult {
    fn collect(&mut self, prefix: &str, outcome: std::result::Result<(), validator::ValidationErrors>) {
        if let Err(errors) = outcome {
            for (field, problems) in errors.field_errors() {
                for problem in problems {
                    self.push(format!("{prefix}{field}"), describe(problem));
                }
            }
        }
    }

    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
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
