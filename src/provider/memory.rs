//! In-process provider.
//!
//! Keeps resources in memory for dry runs and tests. Failures and latency can
//! be scripted per operation and resource name, and every call is recorded.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::ResourceSpec;
use crate::error::{DeployError, ProviderError, Result};

use super::contract::{Provider, ProviderMetadata, Resource};
use super::schema::{builtin_schemas, ResourceSchema};

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_resource`.
    Create,
    /// `update_resource`.
    Update,
    /// `delete_resource`.
    Delete,
}

/// In-process provider.
#[derive(Debug)]
pub struct MemoryProvider {
    name: String,
    schemas: BTreeMap<String, ResourceSchema>,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, Resource>,
    failures: HashMap<(Operation, String), String>,
    delays: HashMap<String, Duration>,
    calls: Vec<String>,
}

impl MemoryProvider {
    /// Creates an empty provider with the built-in schemas.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            schemas: builtin_schemas(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Adds or replaces a schema.
    #[must_use]
    pub fn with_schema(mut self, schema: ResourceSchema) -> Self {
        self.schemas.insert(schema.resource_type.clone(), schema);
        self
    }

    /// Makes every `operation` on resource `name` fail with `message`.
    pub fn fail_on(&self, operation: Operation, name: &str, message: &str) {
        self.with_inner(|inner| {
            inner
                .failures
                .insert((operation, name.to_string()), message.to_string());
        });
    }

    /// Removes a scripted failure.
    pub fn clear_failure(&self, operation: Operation, name: &str) {
        self.with_inner(|inner| {
            inner.failures.remove(&(operation, name.to_string()));
        });
    }

    /// Delays every operation on resource `name`.
    pub fn delay(&self, name: &str, delay: Duration) {
        self.with_inner(|inner| {
            inner.delays.insert(name.to_string(), delay);
        });
    }

    /// Returns the calls made so far, as `operation:name` strings.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.with_inner(|inner| inner.calls.clone())
    }

    /// Returns the live resources keyed by id.
    #[must_use]
    pub fn resources(&self) -> BTreeMap<String, Resource> {
        self.with_inner(|inner| inner.resources.clone())
    }

    /// Returns the live resource named `name`, if any.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<Resource> {
        self.with_inner(|inner| inner.resources.values().find(|r| r.name == name).cloned())
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Records a call and returns its scripted delay and failure.
    fn record(&self, operation: Operation, label: &str, name: &str) -> (Option<Duration>, Option<String>) {
        self.with_inner(|inner| {
            inner.calls.push(format!("{label}:{name}"));
            (
                inner.delays.get(name).copied(),
                inner.failures.get(&(operation, name.to_string())).cloned(),
            )
        })
    }

    async fn script(&self, operation: Operation, label: &str, name: &str) -> Result<()> {
        let (delay, failure) = self.record(operation, label, name);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => Err(ProviderError::Rejected { message }.into()),
            None => Ok(()),
        }
    }

    fn name_of(&self, id: &str) -> Result<String> {
        self.with_inner(|inner| inner.resources.get(id).map(|r| r.name.clone()))
            .ok_or_else(|| DeployError::from(ProviderError::ResourceNotFound { id: id.to_string() }))
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: self.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            provider_type: String::from("memory"),
            description: String::from("In-process resources"),
        }
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        self.schemas.get(resource_type).cloned()
    }

    async fn initialize(&self) -> Result<()> {
        debug!(provider = %self.name, "Memory provider ready");
        Ok(())
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<Resource> {
        self.script(Operation::Create, "create", &spec.name).await?;

        let id = format!("{}-{}", spec.resource_type, &Uuid::new_v4().simple().to_string()[..8]);
        let mut resource = Resource::from_spec(id.clone(), spec, "running");
        resource
            .outputs
            .insert(String::from("id"), id.clone().into());

        self.with_inner(|inner| inner.resources.insert(id, resource.clone()));
        Ok(resource)
    }

    async fn update_resource(&self, id: &str, spec: &ResourceSpec) -> Result<Resource> {
        self.script(Operation::Update, "update", &spec.name).await?;
        self.name_of(id)?;

        let mut resource = Resource::from_spec(id, spec, "running");
        resource
            .outputs
            .insert(String::from("id"), id.to_string().into());

        self.with_inner(|inner| inner.resources.insert(id.to_string(), resource.clone()));
        Ok(resource)
    }

    async fn delete_resource(&self, id: &str) -> Result<()> {
        let name = self.name_of(id)?;
        self.script(Operation::Delete, "delete", &name).await?;

        self.with_inner(|inner| inner.resources.remove(id));
        Ok(())
    }

    async fn get_resource(&self, id: &str) -> Result<Resource> {
        self.with_inner(|inner| inner.resources.get(id).cloned())
            .ok_or_else(|| ProviderError::ResourceNotFound { id: id.to_string() }.into())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn spec(name: &str) -> ResourceSpec {
        ResourceSpec::new(name, "instance", "mem").with_property("image", "web:1")
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let provider = MemoryProvider::new("mem");

        let created = assert_ok!(provider.create_resource(&spec("web")).await);
        assert!(created.id.starts_with("instance-"));
        assert_eq!(provider.find_by_name("web").map(|r| r.id), Some(created.id.clone()));

        let updated = assert_ok!(
            provider
                .update_resource(&created.id, &spec("web").with_property("replicas", 2_i64))
                .await
        );
        assert_eq!(updated.properties.len(), 2);

        assert_ok!(provider.delete_resource(&created.id).await);
        assert_err!(provider.get_resource(&created.id).await);
        assert_eq!(provider.calls(), vec!["create:web", "update:web", "delete:web"]);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let provider = MemoryProvider::new("mem");
        provider.fail_on(Operation::Create, "db", "quota exceeded");

        let err = assert_err!(provider.create_resource(&spec("db")).await);
        assert!(err.to_string().contains("quota exceeded"));
        assert!(provider.resources().is_empty());

        provider.clear_failure(Operation::Create, "db");
        assert_ok!(provider.create_resource(&spec("db")).await);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let provider = MemoryProvider::new("mem");

        let err = assert_err!(provider.delete_resource("missing").await);
        assert!(matches!(
            err,
            DeployError::Provider(ProviderError::ResourceNotFound { .. })
        ));
    }
}
