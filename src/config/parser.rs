//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files, the optional
//! `.env` file next to it, and `ENVDEPLOY_*` environment overrides.

use crate::error::{ConfigError, DeployError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::DeployConfig;

/// Environment variable overriding `state.path`.
pub const ENV_STATE_PATH: &str = "ENVDEPLOY_STATE_PATH";

/// Environment variable overriding `defaults.parallel`.
pub const ENV_DEFAULT_PARALLEL: &str = "ENVDEPLOY_DEFAULT_PARALLEL";

/// Configuration parser for loading deployment configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Returns the base path, if set.
    #[must_use]
    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(DeployError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source
                .map(|p| p.display().to_string())
                .or_else(|| e.location().map(|l| format!("line {}, column {}", l.line(), l.column())));
            DeployError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            environments = config.environments.len(),
            providers = config.providers.len(),
            "Successfully parsed configuration"
        );
        Ok(config)
    }

    /// Loads configuration with `.env` and environment variable overrides.
    ///
    /// Recognized variables: `ENVDEPLOY_STATE_PATH`,
    /// `ENVDEPLOY_DEFAULT_PARALLEL`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        let parser = match (&self.base_path, path.parent()) {
            (None, Some(dir)) if !dir.as_os_str().is_empty() => Self::new().with_base_path(dir),
            _ => Self {
                base_path: self.base_path.clone(),
            },
        };
        parser.load_dotenv()?;

        let mut config = parser.load_file(path)?;
        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(
        config: &mut DeployConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(path) = lookup(ENV_STATE_PATH) {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Some(parallel) = lookup(ENV_DEFAULT_PARALLEL) {
            debug!("Overriding defaults.parallel from environment");
            config.defaults.parallel = parallel.trim().parse().map_err(|_| {
                ConfigError::validation(
                    format!("{ENV_DEFAULT_PARALLEL} must be a positive integer, got '{parallel}'"),
                    "defaults.parallel",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                DeployError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Resolves the state directory for a loaded configuration.
    ///
    /// Relative paths are resolved against the base path.
    #[must_use]
    pub fn state_dir(&self, config: &DeployConfig) -> PathBuf {
        let base = self.base_path.clone().unwrap_or_else(|| PathBuf::from("."));
        match &config.state.path {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => base.join(path),
            None => base.join(crate::state::STATE_DIR),
        }
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["envdeploy.yaml", "envdeploy.yml", "deploy.yaml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    warn!("No configuration file found above {}", start.display());
    Err(DeployError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
