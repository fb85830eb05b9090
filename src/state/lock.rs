//! Environment locking.
//!
//! A lock is a marker file whose presence excludes every other mutating
//! operation on the environment. Locks are advisory and never expire on their
//! own: a lock left behind by a crashed process is reported as stale and must
//! be removed explicitly.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Age after which a lock is reported as stale (30 minutes).
pub const DEFAULT_STALE_AFTER_SECS: i64 = 1800;

/// Information about an environment lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Process id of the holder.
    pub process: u32,
    /// When the lock was acquired.
    pub time: DateTime<Utc>,
}

impl LockInfo {
    /// Creates lock info for the current process.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            process: std::process::id(),
            time: Utc::now(),
        }
    }

    /// Returns how long the lock has been held.
    #[must_use]
    pub fn age(&self) -> Duration {
        Utc::now() - self.time
    }

    /// Checks whether the lock is older than `threshold`.
    #[must_use]
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() > threshold
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_creation() {
        let lock = LockInfo::new("test-holder");
        assert_eq!(lock.holder, "test-holder");
        assert_eq!(lock.process, std::process::id());
        assert!(!lock.is_stale(Duration::seconds(DEFAULT_STALE_AFTER_SECS)));
    }

    #[test]
    fn test_stale_detection() {
        let mut lock = LockInfo::new("test-holder");
        lock.time = Utc::now() - Duration::hours(2);

        assert!(lock.is_stale(Duration::seconds(DEFAULT_STALE_AFTER_SECS)));
        assert!(!lock.is_stale(Duration::hours(3)));
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        // IDs should be unique
        assert_ne!(id1, id2);

        // IDs should contain the process ID
        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }
}
