//! The provider capability contract.
//!
//! A provider performs the real work behind a resource: create, update,
//! delete and read. The orchestrator only ever talks to providers through this
//! trait, so implementations can live in process (`local`, `memory`) or behind
//! a plugin protocol (`http`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{PropertyMap, ResourceSpec};
use crate::error::Result;

use super::schema::ResourceSchema;

/// Descriptive information about a provider implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Provider name.
    pub name: String,
    /// Implementation version.
    #[serde(default)]
    pub version: String,
    /// Implementation kind (`local`, `memory`, `http`, ...).
    #[serde(default, rename = "type")]
    pub provider_type: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
}

/// A resource as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Provider-assigned id.
    pub id: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource name.
    pub name: String,
    /// Properties as applied.
    #[serde(default)]
    pub properties: PropertyMap,
    /// Provider-specific status text.
    #[serde(default)]
    pub status: String,
    /// Values produced by the provider (addresses, generated credentials ids, ...).
    #[serde(default)]
    pub outputs: PropertyMap,
}

/// Polymorphic provider capability.
///
/// Schemas are available once [`Provider::initialize`] has succeeded.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns descriptive information about the provider.
    fn metadata(&self) -> ProviderMetadata;

    /// Returns the schema of a resource type, or `None` if the type is not
    /// managed by this provider.
    fn schema(&self, resource_type: &str) -> Option<ResourceSchema>;

    /// Prepares the provider for use.
    async fn initialize(&self) -> Result<()>;

    /// Creates a resource.
    async fn create_resource(&self, spec: &ResourceSpec) -> Result<Resource>;

    /// Updates an existing resource in place.
    async fn update_resource(&self, id: &str, spec: &ResourceSpec) -> Result<Resource>;

    /// Deletes a resource.
    async fn delete_resource(&self, id: &str) -> Result<()>;

    /// Reads a resource.
    async fn get_resource(&self, id: &str) -> Result<Resource>;

    /// Releases provider resources.
    async fn shutdown(&self) -> Result<()>;
}

impl Resource {
    /// Creates a resource record from a spec.
    #[must_use]
    pub fn from_spec(id: impl Into<String>, spec: &ResourceSpec, status: &str) -> Self {
        Self {
            id: id.into(),
            resource_type: spec.resource_type.clone(),
            name: spec.name.clone(),
            properties: spec.properties.clone(),
            status: status.to_string(),
            outputs: PropertyMap::new(),
        }
    }
}
