//! Execution options.

use std::time::Duration;

/// Options for a single execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Maximum number of concurrent provider operations.
    pub parallelism: usize,
    /// Time budget, measured from the start of execution.
    pub timeout: Option<Duration>,
    /// Deploy version recorded in history.
    pub version: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            timeout: None,
            version: None,
        }
    }
}

impl ExecuteOptions {
    /// Sets the parallelism bound; zero is treated as one.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the time budget.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the deploy version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Options for a full deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOptions {
    /// Execution options.
    pub execute: ExecuteOptions,
    /// Roll back automatically after a partial failure.
    pub auto_rollback: bool,
    /// Write an operator backup of the state before executing.
    pub backup: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            execute: ExecuteOptions::default(),
            auto_rollback: true,
            backup: true,
        }
    }
}

impl DeployOptions {
    /// Sets the execution options.
    #[must_use]
    pub fn with_execute(mut self, execute: ExecuteOptions) -> Self {
        self.execute = execute;
        self
    }

    /// Enables or disables automatic rollback.
    #[must_use]
    pub const fn with_auto_rollback(mut self, auto_rollback: bool) -> Self {
        self.auto_rollback = auto_rollback;
        self
    }

    /// Enables or disables the pre-execution backup.
    #[must_use]
    pub const fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }
}
