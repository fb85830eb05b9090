//! Filesystem-backed provider.
//!
//! Each resource is a JSON document under the provider root, named by its id.
//! Writes go through a temporary file and a rename so a resource file is never
//! left half written.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ResourceSpec;
use crate::error::{ProviderError, Result, StateError};

use super::contract::{Provider, ProviderMetadata, Resource};
use super::schema::{builtin_schemas, ResourceSchema};

/// Filesystem-backed provider.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    name: String,
    root: PathBuf,
    schemas: BTreeMap<String, ResourceSchema>,
}

impl LocalProvider {
    /// Creates a provider storing resources under `root`.
    #[must_use]
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            root: root.into(),
            schemas: builtin_schemas(),
        }
    }

    /// Returns the resource directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(ProviderError::ResourceNotFound { id: id.to_string() }.into());
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    async fn write(&self, resource: &Resource) -> Result<()> {
        let path = self.resource_path(&resource.id)?;
        let temp_path = path.with_extension("json.tmp");

        let content = serde_json::to_vec_pretty(resource)
            .map_err(|e| StateError::serialization(format!("Failed to serialize resource: {e}")))?;

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage("create", &temp_path, e))?;
        file.write_all(&content)
            .await
            .map_err(|e| StateError::storage("write", &temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage("sync", &temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StateError::storage("rename", &path, e))?;
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Resource> {
        let path = self.resource_path(id)?;
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::ResourceNotFound { id: id.to_string() }.into());
            }
            Err(e) => return Err(StateError::storage("read", &path, e).into()),
        };

        serde_json::from_slice(&content).map_err(|e| {
            ProviderError::Rejected {
                message: format!("resource file {} is corrupted: {e}", path.display()),
            }
            .into()
        })
    }

    fn with_outputs(&self, mut resource: Resource) -> Resource {
        let path = self.root.join(format!("{}.json", resource.id));
        resource
            .outputs
            .insert(String::from("id"), resource.id.clone().into());
        resource
            .outputs
            .insert(String::from("path"), path.display().to_string().into());
        resource
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: self.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            provider_type: String::from("local"),
            description: format!("Filesystem resources under {}", self.root.display()),
        }
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        self.schemas.get(resource_type).cloned()
    }

    async fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            ProviderError::InitializationFailed {
                provider: self.name.clone(),
                message: format!("cannot create {}: {e}", self.root.display()),
            }
        })?;
        info!(provider = %self.name, root = %self.root.display(), "Local provider initialized");
        Ok(())
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<Resource> {
        let id = format!("{}-{}", spec.resource_type, &Uuid::new_v4().simple().to_string()[..8]);
        let resource = self.with_outputs(Resource::from_spec(id, spec, "running"));

        self.write(&resource).await?;
        debug!(resource = %spec.name, id = %resource.id, "Created local resource");
        Ok(resource)
    }

    async fn update_resource(&self, id: &str, spec: &ResourceSpec) -> Result<Resource> {
        self.read(id).await?;
        let resource = self.with_outputs(Resource::from_spec(id, spec, "running"));

        self.write(&resource).await?;
        debug!(resource = %spec.name, id, "Updated local resource");
        Ok(resource)
    }

    async fn delete_resource(&self, id: &str) -> Result<()> {
        let path = self.resource_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(id, "Deleted local resource");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProviderError::ResourceNotFound { id: id.to_string() }.into())
            }
            Err(e) => Err(StateError::storage("remove", &path, e).into()),
        }
    }

    async fn get_resource(&self, id: &str) -> Result<Resource> {
        self.read(id).await
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
