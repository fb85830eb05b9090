//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::Result;
use super::types::State;
use super::lock::LockInfo;

/// Trait for state storage backends.
///
/// Every operation is scoped to one environment and touches nothing that
/// belongs to another.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state of an environment.
    ///
    /// Returns an empty initialized state if none exists yet.
    async fn load(&self, environment: &str) -> Result<State>;

    /// Saves the state of an environment atomically.
    ///
    /// Stamps `state.last_update` with a timestamp strictly greater than the
    /// previous one.
    async fn save(&self, environment: &str, state: &mut State) -> Result<()>;

    /// Acquires the environment lock.
    ///
    /// Never waits: fails with `LockConflict` if a lock exists, stale or not.
    async fn lock(&self, environment: &str) -> Result<LockInfo>;

    /// Releases a lock previously returned by [`StateStore::lock`].
    async fn unlock(&self, environment: &str, lock: &LockInfo) -> Result<()>;

    /// Removes the environment lock regardless of holder.
    ///
    /// Returns the removed lock, if there was one.
    async fn force_unlock(&self, environment: &str) -> Result<Option<LockInfo>>;

    /// Gets current lock information if locked.
    async fn lock_info(&self, environment: &str) -> Result<Option<LockInfo>>;

    /// Writes a timestamped JSON copy of the environment state.
    ///
    /// Uses the backend's backup directory when `destination` is `None`.
    async fn backup(&self, environment: &str, destination: Option<&Path>) -> Result<PathBuf>;

    /// Lists environments that have persisted state.
    async fn list_environments(&self) -> Result<Vec<String>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self, environment: &str) -> Result<State> {
        (**self).load(environment).await
    }

    async fn save(&self, environment: &str, state: &mut State) -> Result<()> {
        (**self).save(environment, state).await
    }

    async fn lock(&self, environment: &str) -> Result<LockInfo> {
        (**self).lock(environment).await
    }

    async fn unlock(&self, environment: &str, lock: &LockInfo) -> Result<()> {
        (**self).unlock(environment, lock).await
    }

    async fn force_unlock(&self, environment: &str) -> Result<Option<LockInfo>> {
        (**self).force_unlock(environment).await
    }

    async fn lock_info(&self, environment: &str) -> Result<Option<LockInfo>> {
        (**self).lock_info(environment).await
    }

    async fn backup(&self, environment: &str, destination: Option<&Path>) -> Result<PathBuf> {
        (**self).backup(environment, destination).await
    }

    async fn list_environments(&self) -> Result<Vec<String>> {
        (**self).list_environments().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
