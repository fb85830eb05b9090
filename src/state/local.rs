//! Local file-based state storage backend.
//!
//! Layout under the state directory:
//!
//! ```text
//! states/<env>.json                          environment state
//! locks/<env>.lock                           lock marker
//! backups/<env>.backup-YYYYMMDD-HHMMSS.json  operator backups
//! ```

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, DEFAULT_STALE_AFTER_SECS};
use super::store::StateStore;
use super::types::{State, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".envdeploy";

const STATES_DIR: &str = "states";
const LOCKS_DIR: &str = "locks";
const BACKUPS_DIR: &str = "backups";

/// Local file-based state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Identifier written into locks taken by this store.
    holder: String,
    /// Age after which a conflicting lock is reported as stale.
    stale_after: Duration,
}

impl LocalStateStore {
    /// Creates a new local state store rooted in `.envdeploy` under the
    /// current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| DeployError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            holder: generate_holder_id(),
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        }
    }

    /// Sets the age after which a conflicting lock is reported as stale.
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the holder identifier recorded in acquired locks.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path of an environment's state file.
    #[must_use]
    pub fn state_path(&self, environment: &str) -> PathBuf {
        self.base_dir.join(STATES_DIR).join(format!("{environment}.json"))
    }

    /// Returns the path of an environment's lock marker.
    #[must_use]
    pub fn lock_path(&self, environment: &str) -> PathBuf {
        self.base_dir.join(LOCKS_DIR).join(format!("{environment}.lock"))
    }

    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StateError::storage("create", dir, e))?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self, environment: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(environment);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::storage("read", &path, e).into()),
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock file {}: {e}", path.display()),
        })?;

        Ok(Some(lock_info))
    }

    async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage("create", &temp_path, e))?;

        file.write_all(content)
            .await
            .map_err(|e| StateError::storage("write", &temp_path, e))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::storage("sync", &temp_path, e))?;

        // Atomic rename
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::storage("rename", path, e))?;

        Ok(())
    }

    fn conflict(&self, environment: &str, existing: Option<LockInfo>) -> DeployError {
        match existing {
            Some(existing) => DeployError::LockConflict {
                environment: environment.to_string(),
                stale: existing.is_stale(self.stale_after),
                holder: existing.holder,
                process: existing.process,
                since: existing.time.to_rfc3339(),
            },
            // The holder is still writing its marker.
            None => DeployError::LockConflict {
                environment: environment.to_string(),
                holder: String::from("unknown"),
                process: 0,
                since: String::from("unknown"),
                stale: false,
            },
        }
    }
}

/// Checks that an environment name is usable as a file stem.
///
/// # Errors
///
/// Returns `StateError::InvalidEnvironment` for empty names, names starting
/// with a dot and names with characters outside `[A-Za-z0-9_.-]`.
pub fn validate_environment_name(environment: &str) -> Result<()> {
    let valid = !environment.is_empty()
        && environment.len() <= 64
        && !environment.starts_with('.')
        && environment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidEnvironment {
            name: environment.to_string(),
        }
        .into())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, environment: &str) -> Result<State> {
        validate_environment_name(environment)?;
        let path = self.state_path(environment);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(environment, "No state yet, starting empty");
                return Ok(State::new(environment));
            }
            Err(e) => return Err(StateError::storage("read", &path, e).into()),
        };

        debug!("Loading state from: {}", path.display());

        let state: State = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state file {}: {e}", path.display()),
        })?;

        if state.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }
            .into());
        }

        if state.environment != environment {
            return Err(StateError::Corrupted {
                message: format!(
                    "{} holds state for environment '{}'",
                    path.display(),
                    state.environment
                ),
            }
            .into());
        }

        Ok(state)
    }

    async fn save(&self, environment: &str, state: &mut State) -> Result<()> {
        validate_environment_name(environment)?;
        let path = self.state_path(environment);
        Self::ensure_dir(&self.base_dir.join(STATES_DIR)).await?;

        let now = Utc::now();
        let stamp = match state.last_update {
            Some(previous) if now <= previous => previous + Duration::microseconds(1),
            _ => now,
        };
        state.last_update = Some(stamp);
        state.environment = environment.to_string();

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        Self::write_atomic(&path, content.as_bytes()).await?;

        debug!(environment, last_update = %stamp, "State saved");
        Ok(())
    }

    async fn lock(&self, environment: &str) -> Result<LockInfo> {
        validate_environment_name(environment)?;
        let path = self.lock_path(environment);
        Self::ensure_dir(&self.base_dir.join(LOCKS_DIR)).await?;

        let lock_info = LockInfo::new(&self.holder);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = self.read_lock_file(environment).await.unwrap_or_else(|e| {
                    warn!(environment, "Unreadable lock marker: {e}");
                    None
                });
                return Err(self.conflict(environment, existing));
            }
            Err(e) => return Err(StateError::storage("create", &path, e).into()),
        };

        let written = async {
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&path).await;
            return Err(StateError::storage("write", &path, e).into());
        }

        info!(environment, lock_id = %lock_info.lock_id, "Acquired environment lock");
        Ok(lock_info)
    }

    async fn unlock(&self, environment: &str, lock: &LockInfo) -> Result<()> {
        validate_environment_name(environment)?;

        let Some(existing) = self.read_lock_file(environment).await? else {
            return Err(StateError::NotLocked {
                environment: environment.to_string(),
            }
            .into());
        };

        if existing.lock_id != lock.lock_id {
            return Err(StateError::LockMismatch {
                environment: environment.to_string(),
                expected: lock.lock_id.clone(),
                found: existing.lock_id,
                holder: existing.holder,
            }
            .into());
        }

        let path = self.lock_path(environment);
        fs::remove_file(&path)
            .await
            .map_err(|e| StateError::storage("remove", &path, e))?;

        info!(environment, lock_id = %lock.lock_id, "Released environment lock");
        Ok(())
    }

    async fn force_unlock(&self, environment: &str) -> Result<Option<LockInfo>> {
        validate_environment_name(environment)?;
        let path = self.lock_path(environment);

        let existing = self.read_lock_file(environment).await.unwrap_or_else(|e| {
            warn!(environment, "Removing unreadable lock marker: {e}");
            None
        });

        match fs::remove_file(&path).await {
            Ok(()) => {
                warn!(environment, holder = ?existing.as_ref().map(|l| &l.holder), "Lock forcibly removed");
                Ok(existing)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::storage("remove", &path, e).into()),
        }
    }

    async fn lock_info(&self, environment: &str) -> Result<Option<LockInfo>> {
        validate_environment_name(environment)?;
        self.read_lock_file(environment).await
    }

    async fn backup(&self, environment: &str, destination: Option<&Path>) -> Result<PathBuf> {
        let state = self.load(environment).await?;

        let dir = destination.map_or_else(|| self.base_dir.join(BACKUPS_DIR), Path::to_path_buf);
        Self::ensure_dir(&dir).await?;

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let mut path = dir.join(format!("{environment}.backup-{stamp}.json"));
        let mut attempt = 1;
        while path.exists() {
            path = dir.join(format!("{environment}.backup-{stamp}-{attempt}.json"));
            attempt += 1;
        }

        let content = serde_json::to_string_pretty(&state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize backup: {e}")))?;
        Self::write_atomic(&path, content.as_bytes()).await?;

        info!(environment, path = %path.display(), "State backup written");
        Ok(path)
    }

    async fn list_environments(&self) -> Result<Vec<String>> {
        let dir = self.base_dir.join(STATES_DIR);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::storage("read", &dir, e).into()),
        };

        let mut environments = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::storage("read", &dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem() {
                    environments.push(stem.to_string_lossy().to_string());
                }
            }
        }

        environments.sort();
        Ok(environments)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind as DeployErrorKind;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_load_nonexistent_returns_empty_state() {
        let (store, _temp) = create_test_store();

        let state = store.load("dev").await.expect("Load should not fail");
        assert_eq!(state.environment, "dev");
        assert!(state.resources.is_empty());
        assert!(state.last_update.is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = State::new("dev");
        store.save("dev", &mut state).await.expect("Failed to save state");
        assert!(state.last_update.is_some());

        let loaded = store.load("dev").await.expect("Failed to load state");
        assert_eq!(loaded, state);
        assert!(!store.state_path("dev").with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_save_stamps_strictly_increasing() {
        let (store, _temp) = create_test_store();

        let mut state = State::new("dev");
        store.save("dev", &mut state).await.expect("first save");
        let first = state.last_update;
        store.save("dev", &mut state).await.expect("second save");

        assert!(state.last_update > first);
    }

    #[tokio::test]
    async fn test_environments_are_isolated() {
        let (store, _temp) = create_test_store();

        let mut staging = State::new("staging");
        store.save("staging", &mut staging).await.expect("save staging");
        let _lock = store.lock("staging").await.expect("lock staging");

        let prod = store.load("prod").await.expect("load prod");
        assert!(prod.last_update.is_none());
        let prod_lock = store.lock("prod").await.expect("prod lock is independent");
        store.unlock("prod", &prod_lock).await.expect("unlock prod");

        let envs = store.list_environments().await.expect("list");
        assert_eq!(envs, vec![String::from("staging")]);
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let (store, _temp) = create_test_store();

        let lock = store.lock("dev").await.expect("Failed to acquire lock");
        assert_eq!(store.lock_info("dev").await.expect("lock_info"), Some(lock.clone()));

        store.unlock("dev", &lock).await.expect("Failed to release lock");
        assert!(store.lock_info("dev").await.expect("lock_info").is_none());

        // Lock can be taken again once released
        let again = store.lock("dev").await.expect("relock");
        assert_ne!(again.lock_id, lock.lock_id);
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();
        let other = store.clone().with_holder("other-process");

        let _lock1 = store.lock("dev").await.expect("Failed to acquire first lock");

        let err = other.lock("dev").await.expect_err("second lock must conflict");
        assert_eq!(err.kind(), DeployErrorKind::LockConflict);
        assert!(matches!(err, DeployError::LockConflict { stale: false, .. }));
    }

    #[tokio::test]
    async fn test_at_most_one_concurrent_holder() {
        let (store, _temp) = create_test_store();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone().with_holder(format!("worker-{i}"));
            handles.push(tokio::spawn(async move { store.lock("dev").await }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.expect("task panicked").is_ok() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn test_stale_lock_is_reported_not_taken_over() {
        let (store, _temp) = create_test_store();
        let store = store.with_stale_after(Duration::zero());

        let lock = store.lock("dev").await.expect("lock");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let err = store.lock("dev").await.expect_err("stale lock still conflicts");
        assert!(matches!(err, DeployError::LockConflict { stale: true, .. }));
        assert!(err.to_string().contains("unlock --force"));

        let removed = store.force_unlock("dev").await.expect("force unlock");
        assert_eq!(removed.map(|l| l.lock_id), Some(lock.lock_id));
        store.lock("dev").await.expect("lock after force unlock");
    }

    #[tokio::test]
    async fn test_unlock_requires_matching_lock() {
        let (store, _temp) = create_test_store();

        let stranger = LockInfo::new("stranger");
        let err = store.unlock("dev", &stranger).await.expect_err("not locked");
        assert!(matches!(err, DeployError::State(StateError::NotLocked { .. })));

        let _lock = store.lock("dev").await.expect("lock");
        let err = store.unlock("dev", &stranger).await.expect_err("mismatch");
        assert!(matches!(err, DeployError::State(StateError::LockMismatch { .. })));
        assert!(store.lock_info("dev").await.expect("lock_info").is_some());
    }

    #[tokio::test]
    async fn test_backup_writes_timestamped_copy() {
        let (store, temp) = create_test_store();

        let mut state = State::new("dev");
        store.save("dev", &mut state).await.expect("save");

        let first = store.backup("dev", None).await.expect("backup");
        let second = store.backup("dev", None).await.expect("second backup");
        assert_ne!(first, second);
        assert!(first.starts_with(temp.path().join("backups")));

        let name = first.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        assert!(name.starts_with("dev.backup-"));

        let content = std::fs::read_to_string(&first).expect("read backup");
        let restored: State = serde_json::from_str(&content).expect("parse backup");
        assert_eq!(restored, state);

        let custom = temp.path().join("elsewhere");
        let third = store.backup("dev", Some(&custom)).await.expect("custom backup");
        assert!(third.starts_with(&custom));
    }

    #[tokio::test]
    async fn test_invalid_environment_names_rejected() {
        let (store, _temp) = create_test_store();

        for name in ["", "../prod", "a/b", ".hidden"] {
            let err = store.load(name).await.expect_err("invalid name");
            assert!(matches!(err, DeployError::State(StateError::InvalidEnvironment { .. })));
        }
    }

    #[tokio::test]
    async fn test_corrupted_state_is_an_error() {
        let (store, _temp) = create_test_store();

        let path = store.state_path("dev");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "{ not json").expect("write");

        let err = store.load("dev").await.expect_err("corrupted");
        assert!(matches!(err, DeployError::State(StateError::Corrupted { .. })));
    }
}
