//! Error types for the envdeploy orchestration engine.
//!
//! Every top-level error renders with its kind as a message prefix
//! (`ConfigError:`, `LockConflict:`, ...) so scripts can tell failures apart
//! from the first word of the message, and maps to a distinct exit code.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for envdeploy.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Malformed or incomplete desired configuration.
    #[error("ConfigError: {0}")]
    Config(#[from] ConfigError),

    /// Another operation holds the environment lock.
    #[error(
        "LockConflict: environment '{environment}' is locked by {holder} (pid {process}) since {since}{}",
        stale_hint(.stale)
    )]
    LockConflict {
        /// Environment that is locked.
        environment: String,
        /// Identifier of the lock holder.
        holder: String,
        /// Process id recorded by the holder.
        process: u32,
        /// When the lock was taken (RFC 3339).
        since: String,
        /// Whether the lock is older than the staleness threshold.
        stale: bool,
    },

    /// State changed between planning and execution.
    #[error(
        "StalePlanError: state of environment '{environment}' changed since the plan was computed (planned against {planned_against}, found {found}); re-run plan"
    )]
    StalePlan {
        /// Environment name.
        environment: String,
        /// State timestamp the plan was computed against.
        planned_against: String,
        /// State timestamp found at execution time.
        found: String,
    },

    /// Dependency cycle or unresolved dependency.
    #[error("DependencyError: {0}")]
    Dependency(#[from] DependencyError),

    /// A provider operation failed.
    #[error("ProviderError: {0}")]
    Provider(#[from] ProviderError),

    /// Reversal of a failed execution failed.
    #[error("RollbackError: {0}")]
    Rollback(#[from] RollbackError),

    /// State persistence errors.
    #[error("StateError: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("InternalError: {0}")]
    Internal(String),
}

/// Error kind, used for exit codes and scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`DeployError::Config`].
    Config,
    /// See [`DeployError::LockConflict`].
    LockConflict,
    /// See [`DeployError::StalePlan`].
    StalePlan,
    /// See [`DeployError::Dependency`].
    Dependency,
    /// See [`DeployError::Provider`].
    Provider,
    /// See [`DeployError::Rollback`].
    Rollback,
    /// See [`DeployError::State`].
    State,
    /// IO and internal errors.
    Internal,
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// The requested environment is not configured.
    #[error("environment '{name}' not found in configuration")]
    UnknownEnvironment {
        /// Requested environment.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("duplicate resource name '{name}' in environment '{environment}'")]
    DuplicateName {
        /// Environment name.
        environment: String,
        /// The duplicated name.
        name: String,
    },

    /// A property does not match the provider's schema.
    #[error("resource '{resource}' ({resource_type}, provider '{provider}'): {message}")]
    Schema {
        /// Resource name.
        resource: String,
        /// Resource type.
        resource_type: String,
        /// Provider name.
        provider: String,
        /// What is wrong.
        message: String,
    },

    /// A template reference could not be resolved.
    #[error("resource '{resource}' property '{property}': unknown reference '${{{reference}}}'")]
    UnresolvedReference {
        /// Resource name.
        resource: String,
        /// Property key.
        property: String,
        /// The reference text.
        reference: String,
    },

    /// An existing resource changed type or provider.
    #[error(
        "resource '{resource}' cannot change {field} from '{from}' to '{to}'; remove it and deploy before re-adding"
    )]
    ImmutableField {
        /// Resource name.
        resource: String,
        /// Field name (`type` or `provider`).
        field: String,
        /// Recorded value.
        from: String,
        /// Desired value.
        to: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("state is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Reading or writing state files failed.
    #[error("failed to {action} {path}: {message}")]
    Storage {
        /// What was attempted.
        action: String,
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        message: String,
    },

    /// Serialization error.
    #[error("state serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("state version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// Environment name cannot be used as a state key.
    #[error("invalid environment name '{name}'")]
    InvalidEnvironment {
        /// The rejected name.
        name: String,
    },

    /// Unlock requested for an environment without a lock.
    #[error("environment '{environment}' is not locked")]
    NotLocked {
        /// Environment name.
        environment: String,
    },

    /// Unlock requested by a caller that does not hold the lock.
    #[error("lock on environment '{environment}' is held by {holder} ({found}), not {expected}")]
    LockMismatch {
        /// Environment name.
        environment: String,
        /// Lock id the caller presented.
        expected: String,
        /// Lock id found on disk.
        found: String,
        /// Holder recorded in the lock.
        holder: String,
    },

    /// A resource status transition is not allowed.
    #[error("resource '{resource}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// Resource name.
        resource: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DependencyError {
    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected between: {}", .participants.join(", "))]
    Cycle {
        /// Resources participating in (or blocked by) the cycle.
        participants: Vec<String>,
    },

    /// A dependency names a resource that does not exist.
    #[error("resource '{resource}' depends on unknown resource '{dependency}'")]
    Unresolved {
        /// Resource declaring the dependency.
        resource: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A resource lists itself as a dependency.
    #[error("resource '{resource}' depends on itself")]
    SelfReference {
        /// Resource name.
        resource: String,
    },

    /// A planned creation would run before one of its dependencies exists.
    #[error("resource '{resource}' is planned before its dependency '{dependency}' is running")]
    CreationOrder {
        /// Resource to create.
        resource: String,
        /// Dependency that is neither running nor created earlier.
        dependency: String,
    },
}

/// Provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No provider is registered under this name.
    #[error("provider '{name}' is not registered")]
    NotFound {
        /// Requested provider name.
        name: String,
    },

    /// Unknown provider type in configuration.
    #[error("provider '{name}' has unsupported type '{provider_type}'")]
    UnsupportedType {
        /// Provider name.
        name: String,
        /// Configured type.
        provider_type: String,
    },

    /// Provider initialization failed.
    #[error("provider '{provider}' failed to initialize: {message}")]
    InitializationFailed {
        /// Provider name.
        provider: String,
        /// Description of the failure.
        message: String,
    },

    /// A resource operation failed.
    #[error("{operation} of resource '{resource}' in environment '{environment}' failed: {message}")]
    OperationFailed {
        /// Environment name.
        environment: String,
        /// Resource name.
        resource: String,
        /// Operation attempted.
        operation: String,
        /// Description of the failure.
        message: String,
    },

    /// The provider does not know the resource id.
    #[error("resource '{id}' not found")]
    ResourceNotFound {
        /// Provider resource id.
        id: String,
    },

    /// The provider rejected the request.
    #[error("request rejected: {message}")]
    Rejected {
        /// Description of the rejection.
        message: String,
    },

    /// Plugin API request failed.
    #[error("plugin request failed: {status} - {message}")]
    ApiRequestFailed {
        /// HTTP status code.
        status: u16,
        /// Error message from the plugin.
        message: String,
    },

    /// Rate limited by the plugin.
    #[error("plugin rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error.
    #[error("network error communicating with plugin: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from plugin.
    #[error("invalid response from plugin: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// One resource that could not be brought to its target state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceFailure {
    /// Environment name.
    pub environment: String,
    /// Resource name.
    pub resource: String,
    /// Operation attempted (`create`, `update`, `delete`, `timeout`, ...).
    pub operation: String,
    /// Description of the failure.
    pub message: String,
}

/// Rollback failure.
#[derive(Debug, Error)]
#[error(
    "rollback of environment '{environment}' incomplete, manual intervention required: {}",
    .failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
)]
pub struct RollbackError {
    /// Environment name.
    pub environment: String,
    /// Reversals that failed.
    pub failures: Vec<ResourceFailure>,
}

const fn stale_hint(stale: &bool) -> &'static str {
    if *stale {
        "; the lock looks stale, remove it with `envdeploy state unlock --force`"
    } else {
        ""
    }
}

/// Result type alias for envdeploy operations.
pub type Result<T> = std::result::Result<T, DeployError>;

impl DeployError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::LockConflict { .. } => ErrorKind::LockConflict,
            Self::StalePlan { .. } => ErrorKind::StalePlan,
            Self::Dependency(_) => ErrorKind::Dependency,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Rollback(_) => ErrorKind::Rollback,
            Self::State(_) => ErrorKind::State,
            Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Internal => 1,
            ErrorKind::Config => 2,
            ErrorKind::LockConflict => 3,
            ErrorKind::StalePlan => 4,
            ErrorKind::Dependency => 5,
            ErrorKind::Provider => 6,
            ErrorKind::Rollback => 7,
            ErrorKind::State => 8,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(
                ProviderError::RateLimited { .. } | ProviderError::NetworkError { .. }
            ) | Self::LockConflict { .. }
                | Self::StalePlan { .. }
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::RateLimited { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Provider(ProviderError::NetworkError { .. }) => Some(2),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Config => "ConfigError",
            Self::LockConflict => "LockConflict",
            Self::StalePlan => "StalePlanError",
            Self::Dependency => "DependencyError",
            Self::Provider => "ProviderError",
            Self::Rollback => "RollbackError",
            Self::State => "StateError",
            Self::Internal => "InternalError",
        };
        write!(f, "{kind}")
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a storage error for a file operation.
    #[must_use]
    pub fn storage(action: &str, path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            action: action.to_string(),
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a plugin API request error.
    #[must_use]
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiRequestFailed {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of '{}' in '{}': {}",
            self.operation, self.resource, self.environment, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_kind_prefix() {
        let err = DeployError::from(DependencyError::Cycle {
            participants: vec![String::from("a"), String::from("b")],
        });
        assert!(err.to_string().starts_with("DependencyError: "));
        assert!(err.to_string().contains("a, b"));

        let err = DeployError::LockConflict {
            environment: String::from("prod"),
            holder: String::from("host-1"),
            process: 42,
            since: String::from("2024-01-01T00:00:00Z"),
            stale: false,
        };
        assert!(err.to_string().starts_with("LockConflict: "));
        assert!(!err.to_string().contains("stale"));
    }

    #[test]
    fn test_stale_lock_hint() {
        let err = DeployError::LockConflict {
            environment: String::from("prod"),
            holder: String::from("host-1"),
            process: 42,
            since: String::from("2024-01-01T00:00:00Z"),
            stale: true,
        };
        assert!(err.to_string().contains("unlock --force"));
    }

    #[test]
    fn test_exit_codes_distinct() {
        let errors = [
            DeployError::from(ConfigError::validation_general("x")),
            DeployError::from(DependencyError::SelfReference {
                resource: String::from("a"),
            }),
            DeployError::from(ProviderError::NotFound {
                name: String::from("p"),
            }),
            DeployError::from(StateError::serialization("x")),
            DeployError::internal("x"),
        ];
        let mut codes: Vec<u8> = errors.iter().map(DeployError::exit_code).collect();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn test_rollback_error_lists_failures() {
        let err = RollbackError {
            environment: String::from("staging"),
            failures: vec![ResourceFailure {
                environment: String::from("staging"),
                resource: String::from("cache"),
                operation: String::from("delete"),
                message: String::from("boom"),
            }],
        };
        let message = DeployError::from(err).to_string();
        assert!(message.starts_with("RollbackError: "));
        assert!(message.contains("delete of 'cache' in 'staging': boom"));
    }
}
