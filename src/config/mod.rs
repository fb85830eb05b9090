//! Configuration module for envdeploy.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `envdeploy.yaml`
//! - Validation of configuration values
//! - Variable substitution in resource properties
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod template;
mod hash;

pub use spec::{
    DefaultsConfig, DeployConfig, Environment, EnvironmentConfig, PropertyKind, PropertyMap,
    PropertyValue, ProviderConfig, ProviderType, ResourceConfig, ResourceSpec, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, ENV_DEFAULT_PARALLEL, ENV_STATE_PATH, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use template::{TemplateContext, render_properties};
pub use hash::ConfigHasher;
