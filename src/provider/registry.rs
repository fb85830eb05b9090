//! Provider registry.
//!
//! Resolves the provider name a resource is bound to into a concrete
//! implementation. Providers are registered up front, either explicitly or
//! from the `providers` section of the configuration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ProviderConfig, ProviderType};
use crate::error::{ConfigError, ProviderError, Result};

use super::contract::Provider;
use super::http::HttpProvider;
use super::local::LocalProvider;
use super::memory::MemoryProvider;

/// Provider implementations keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    initialized: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from the `providers` configuration section.
    ///
    /// Relative `local` roots are resolved against `base_dir` (the directory
    /// of the configuration file); the default root is
    /// `<state_dir>/resources/<name>`.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider is missing a required setting or its
    /// client cannot be created.
    pub fn from_config(
        providers: &BTreeMap<String, ProviderConfig>,
        base_dir: &Path,
        state_dir: &Path,
    ) -> Result<Self> {
        let mut registry = Self::new();

        for (name, config) in providers {
            let setting = |key: &str| config.properties.get(key).and_then(|v| v.as_str());

            let provider: Arc<dyn Provider> = match config.provider_type {
                ProviderType::Local => {
                    let root = setting("root").map_or_else(
                        || state_dir.join("resources").join(name),
                        |root| base_dir.join(root),
                    );
                    Arc::new(LocalProvider::new(name, root))
                }
                ProviderType::Memory => Arc::new(MemoryProvider::new(name)),
                ProviderType::Http => {
                    let endpoint = setting("endpoint").ok_or_else(|| {
                        ConfigError::validation(
                            format!("provider '{name}' requires an endpoint"),
                            format!("providers.{name}.properties.endpoint"),
                        )
                    })?;
                    let token = setting("token_env").and_then(|var| {
                        let token = std::env::var(var).ok();
                        if token.is_none() {
                            warn!(provider = %name, variable = var, "Plugin token variable is not set");
                        }
                        token
                    });
                    let timeout = config
                        .properties
                        .get("timeout_secs")
                        .and_then(crate::config::PropertyValue::as_i64)
                        .and_then(|secs| u64::try_from(secs).ok());

                    let client = match timeout {
                        Some(secs) => HttpProvider::with_timeout(name, endpoint, token, secs)?,
                        None => HttpProvider::new(name, endpoint, token)?,
                    };
                    Arc::new(client)
                }
            };

            debug!(provider = %name, kind = ?config.provider_type, "Registered provider");
            registry.register(name, provider);
        }

        Ok(registry)
    }

    /// Registers a provider, replacing any previous one with the same name.
    pub fn register(&mut self, name: &str, provider: Arc<dyn Provider>) {
        self.providers.insert(name.to_string(), provider);
    }

    /// Resolves a provider by name.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NotFound` if no provider has that name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound { name: name.to_string() }.into())
    }

    /// Returns whether a provider is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Returns the registered provider names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolves a provider and initializes it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unknown or fails to initialize.
    pub async fn ensure_initialized(&self, name: &str) -> Result<Arc<dyn Provider>> {
        let provider = self.resolve(name)?;

        let mut initialized = self.initialized.lock().await;
        if !initialized.contains(name) {
            provider.initialize().await?;
            initialized.insert(name.to_string());
            info!(provider = %name, "Provider initialized");
        }

        Ok(provider)
    }

    /// Shuts down every initialized provider.
    ///
    /// Every provider is asked to shut down even if an earlier one fails; the
    /// first error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error.
    pub async fn shutdown_all(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        let mut names: Vec<String> = initialized.drain().collect();
        names.sort();

        let mut first_error = None;
        for name in names {
            let Some(provider) = self.providers.get(&name) else {
                continue;
            };
            if let Err(e) = provider.shutdown().await {
                warn!(provider = %name, error = %e, "Provider shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PropertyMap, PropertyValue};
    use crate::error::DeployError;
    use crate::provider::contract::MockProvider;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_unknown() {
        let registry = ProviderRegistry::new();

        let err = registry.resolve("aws").err().expect("unknown");
        assert!(matches!(
            err,
            DeployError::Provider(ProviderError::NotFound { ref name }) if name == "aws"
        ));
    }

    #[tokio::test]
    async fn test_initialize_once() {
        let mut mock = MockProvider::new();
        mock.expect_initialize().times(1).returning(|| Ok(()));
        mock.expect_shutdown().times(1).returning(|| Ok(()));

        let mut registry = ProviderRegistry::new();
        registry.register("mock", Arc::new(mock));

        registry.ensure_initialized("mock").await.expect("first");
        registry.ensure_initialized("mock").await.expect("second");
        registry.shutdown_all().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_failed_initialization_is_retried() {
        let mut mock = MockProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_initialize()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                Err(ProviderError::InitializationFailed {
                    provider: String::from("mock"),
                    message: String::from("not ready"),
                }
                .into())
            });
        mock.expect_initialize()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let mut registry = ProviderRegistry::new();
        registry.register("mock", Arc::new(mock));

        assert!(registry.ensure_initialized("mock").await.is_err());
        assert!(registry.ensure_initialized("mock").await.is_ok());
    }

    #[test]
    fn test_from_config() {
        let temp = TempDir::new().expect("temp dir");
        let mut providers = BTreeMap::new();
        providers.insert(
            String::from("local"),
            ProviderConfig {
                provider_type: ProviderType::Local,
                properties: PropertyMap::new(),
            },
        );
        providers.insert(
            String::from("mem"),
            ProviderConfig {
                provider_type: ProviderType::Memory,
                properties: PropertyMap::new(),
            },
        );
        let mut plugin = PropertyMap::new();
        plugin.insert(
            String::from("endpoint"),
            PropertyValue::from("http://127.0.0.1:7070"),
        );
        providers.insert(
            String::from("plugin"),
            ProviderConfig {
                provider_type: ProviderType::Http,
                properties: plugin,
            },
        );

        let registry = ProviderRegistry::from_config(&providers, temp.path(), &temp.path().join(".envdeploy")).expect("registry");

        assert_eq!(registry.names(), vec!["local", "mem", "plugin"]);
        assert_eq!(
            registry.resolve("plugin").expect("plugin").metadata().provider_type,
            "http"
        );
    }

    #[test]
    fn test_http_requires_endpoint() {
        let temp = TempDir::new().expect("temp dir");
        let mut providers = BTreeMap::new();
        providers.insert(
            String::from("plugin"),
            ProviderConfig {
                provider_type: ProviderType::Http,
                properties: PropertyMap::new(),
            },
        );

        let err = ProviderRegistry::from_config(&providers, temp.path(), &temp.path().join(".envdeploy")).expect_err("endpoint");
        assert!(matches!(err, DeployError::Config(_)));
    }
}
