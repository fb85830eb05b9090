//! State management module for envdeploy.
//!
//! This module provides persistent per-environment state storage: resource
//! records, provider outputs and deployment history, plus the exclusive
//! environment lock that guards every mutation.

mod store;
mod local;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{validate_environment_name, LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, DEFAULT_STALE_AFTER_SECS};
pub use types::{
    DeploymentHistoryEntry, DeploymentOperation, ResourceRecord, ResourceState, ResourceStatus,
    State, MAX_HISTORY, STATE_VERSION,
};
