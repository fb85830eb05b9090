//! Configuration specification types for the deployment system.
//!
//! This module defines all the structs that map to the `envdeploy.yaml` file,
//! plus the resolved [`Environment`] / [`ResourceSpec`] model the engine works
//! on once defaults and templates have been applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::error::ConfigError;
use super::template::{TemplateContext, render_properties};

/// Property mapping of a resource.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A typed resource property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Integer(i64),
    /// Floating-point value.
    Float(f64),
    /// String value.
    String(String),
    /// List of values.
    List(Vec<PropertyValue>),
    /// Nested mapping.
    Map(BTreeMap<String, PropertyValue>),
}

/// The kind of a [`PropertyValue`], used by provider schemas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PropertyKind {
    /// `true` / `false`.
    Bool,
    /// Whole number.
    Integer,
    /// Number (integers accepted).
    Float,
    /// Text.
    String,
    /// Sequence.
    List,
    /// Mapping.
    Map,
    /// Anything.
    Any,
}

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct DeployConfig {
    /// Configuration format version.
    #[serde(default = "default_version")]
    #[validate(length(min = 1))]
    pub version: String,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,
    /// Provider instances keyed by name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Environments keyed by name.
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct StateConfig {
    /// State directory (defaults to `.envdeploy` next to the config file).
    #[serde(default)]
    pub path: Option<String>,
    /// Age in seconds after which a lock is reported as stale.
    #[serde(default = "default_lock_stale_after")]
    #[validate(range(min = 1))]
    pub lock_stale_after_secs: u64,
}

/// Execution defaults, overridable per command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct DefaultsConfig {
    /// Maximum concurrent resource operations.
    #[serde(default = "default_parallel")]
    #[validate(range(min = 1, max = 256))]
    pub parallel: usize,
    /// Execution deadline in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Whether `deploy` writes a state backup before executing.
    #[serde(default = "default_backup")]
    pub backup: bool,
}

/// Provider instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// Provider implementation.
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /// Implementation-specific settings.
    #[serde(default)]
    pub properties: PropertyMap,
}

/// Statically compiled provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Filesystem-backed resources.
    Local,
    /// In-process resources.
    Memory,
    /// Out-of-process plugin over HTTP.
    Http,
}

/// Configuration for a single environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EnvironmentConfig {
    /// Default provider binding for the environment's resources.
    #[serde(default)]
    pub provider: Option<String>,
    /// Region / locality.
    #[serde(default)]
    pub region: Option<String>,
    /// Template variables.
    #[serde(default)]
    pub variables: PropertyMap,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Desired resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// A resource as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct ResourceConfig {
    /// Resource name, unique in its environment.
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    /// Resource type, interpreted by the provider.
    #[serde(rename = "type")]
    #[validate(length(min = 1))]
    pub resource_type: String,
    /// Provider override.
    #[serde(default)]
    pub provider: Option<String>,
    /// Properties (may contain `${...}` references).
    #[serde(default)]
    pub properties: PropertyMap,
    /// Names of resources this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A resolved environment, ready for planning.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Environment {
    /// Environment name.
    pub name: String,
    /// Default provider binding.
    pub provider: Option<String>,
    /// Region / locality.
    pub region: Option<String>,
    /// Template variables.
    pub variables: PropertyMap,
    /// Tags.
    pub tags: BTreeMap<String, String>,
    /// Desired resources with templates rendered and providers bound.
    pub resources: Vec<ResourceSpec>,
}

/// Desired state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Resource name, unique in its environment.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Owning provider name.
    pub provider: String,
    /// Properties.
    #[serde(default)]
    pub properties: PropertyMap,
    /// Dependencies, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_version() -> String {
    String::from("1")
}

const fn default_lock_stale_after() -> u64 {
    1800
}

const fn default_parallel() -> usize {
    1
}

const fn default_backup() -> bool {
    true
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_stale_after_secs: default_lock_stale_after(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            timeout_secs: None,
            backup: default_backup(),
        }
    }
}

impl DeployConfig {
    /// Returns environment names in ascending order.
    #[must_use]
    pub fn environment_names(&self) -> Vec<&str> {
        self.environments.keys().map(String::as_str).collect()
    }

    /// Resolves an environment: binds providers and renders templates.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is unknown, a resource has no
    /// provider binding, or a template reference cannot be resolved.
    pub fn environment(&self, name: &str) -> Result<Environment, ConfigError> {
        let config = self
            .environments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                name: name.to_string(),
            })?;

        let context = TemplateContext::new(name, config.region.as_deref(), &config.variables, &config.tags);

        let resources = config
            .resources
            .iter()
            .map(|resource| {
                let provider = resource
                    .provider
                    .clone()
                    .or_else(|| config.provider.clone())
                    .ok_or_else(|| {
                        ConfigError::validation(
                            format!(
                                "resource '{}' has no provider and environment '{name}' sets no default provider",
                                resource.name
                            ),
                            format!("environments.{name}.resources.{}.provider", resource.name),
                        )
                    })?;

                Ok(ResourceSpec {
                    name: resource.name.clone(),
                    resource_type: resource.resource_type.clone(),
                    provider,
                    properties: render_properties(&resource.name, &resource.properties, &context)?,
                    depends_on: resource.depends_on.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Environment {
            name: name.to_string(),
            provider: config.provider.clone(),
            region: config.region.clone(),
            variables: config.variables.clone(),
            tags: config.tags.clone(),
            resources,
        })
    }
}

impl ResourceSpec {
    /// Creates a spec with no properties or dependencies.
    #[must_use]
    pub fn new(name: &str, resource_type: &str, provider: &str) -> Self {
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            provider: provider.to_string(),
            properties: PropertyMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: &str) -> Self {
        self.depends_on.push(name.to_string());
        self
    }
}

impl PropertyValue {
    /// Returns the kind of this value.
    #[must_use]
    pub const fn kind(&self) -> PropertyKind {
        match self {
            Self::Bool(_) => PropertyKind::Bool,
            Self::Integer(_) => PropertyKind::Integer,
            Self::Float(_) => PropertyKind::Float,
            Self::String(_) => PropertyKind::String,
            Self::List(_) => PropertyKind::List,
            Self::Map(_) => PropertyKind::Map,
        }
    }

    /// Returns the string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl PropertyKind {
    /// Checks whether `value` is acceptable for this kind.
    #[must_use]
    pub const fn accepts(self, value: &PropertyValue) -> bool {
        matches!(
            (self, value),
            (Self::Any, _)
                | (Self::Bool, PropertyValue::Bool(_))
                | (Self::Integer, PropertyValue::Integer(_))
                | (Self::Float, PropertyValue::Float(_) | PropertyValue::Integer(_))
                | (Self::String, PropertyValue::String(_))
                | (Self::List, PropertyValue::List(_))
                | (Self::Map, PropertyValue::Map(_))
        )
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<PropertyValue>> for PropertyValue {
    fn from(value: Vec<PropertyValue>) -> Self {
        Self::List(value)
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s}"),
            Self::List(_) | Self::Map(_) => {
                let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
                write!(f, "{json}")
            }
        }
    }
}

impl std::fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        };
        write!(f, "{kind}")
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Local => "local",
            Self::Memory => "memory",
            Self::Http => "http",
        };
        write!(f, "{kind}")
    }
}
