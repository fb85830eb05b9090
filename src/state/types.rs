//! State types for tracking environment state.
//!
//! These types represent the recorded state of one environment: the status of
//! every managed resource, what was last applied to it, and provider outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{PropertyMap, ResourceSpec};
use crate::error::StateError;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept per environment.
pub const MAX_HISTORY: usize = 100;

/// The complete state of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// State format version.
    pub version: String,
    /// Environment name.
    pub environment: String,
    /// When the state was last persisted. `None` until the first save.
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    /// Resource records keyed by resource name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Provider outputs keyed by resource name.
    #[serde(default)]
    pub outputs: BTreeMap<String, PropertyMap>,
    /// Deployment history (most recent last).
    #[serde(default)]
    pub history: Vec<DeploymentHistoryEntry>,
}

/// Lifecycle state of a managed resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// Scheduled, not yet started.
    Pending,
    /// Provider operation in flight.
    Creating,
    /// Applied successfully.
    Running,
    /// Last attempt failed.
    Failed,
    /// Removed from the provider.
    Deleted,
}

/// Runtime status of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Lifecycle state.
    pub state: ResourceState,
    /// Free-text message (last error, progress note).
    #[serde(default)]
    pub message: String,
    /// When the status last changed.
    pub last_updated: DateTime<Utc>,
}

/// A resource entry in the environment state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Runtime status.
    #[serde(flatten)]
    pub status: ResourceStatus,
    /// Provider-assigned resource id, once created.
    #[serde(default)]
    pub id: Option<String>,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Owning provider name.
    pub provider: String,
    /// Properties as last applied.
    #[serde(default)]
    pub properties: PropertyMap,
    /// Dependencies as last applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A single entry in the deployment history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: DeploymentOperation,
    /// Hash of the desired configuration.
    pub config_hash: String,
    /// Deploy version label, if one was given.
    #[serde(default)]
    pub version: Option<String>,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentOperation {
    /// A plan was executed.
    Deploy,
    /// A failed execution was reversed.
    Rollback,
}

impl ResourceState {
    /// Returns true if `self -> to` is an allowed transition.
    ///
    /// `running -> running` is an in-place update. `pending -> running` is
    /// never allowed: every creation passes through `creating`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Creating)
                | (Self::Creating, Self::Running | Self::Failed)
                | (Self::Running, Self::Running | Self::Failed | Self::Deleted)
                | (Self::Failed, Self::Pending | Self::Creating | Self::Deleted)
                | (Self::Deleted, Self::Pending | Self::Creating)
        )
    }

    /// Returns true for `running` and `deleted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Running | Self::Deleted)
    }
}

impl ResourceStatus {
    /// Creates a status stamped with the current time.
    #[must_use]
    pub fn new(state: ResourceState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            last_updated: Utc::now(),
        }
    }
}

impl ResourceRecord {
    /// Creates a `pending` record for a resource about to be created.
    #[must_use]
    pub fn pending(spec: &ResourceSpec) -> Self {
        Self {
            status: ResourceStatus::new(ResourceState::Pending, "scheduled for creation"),
            id: None,
            resource_type: spec.resource_type.clone(),
            provider: spec.provider.clone(),
            properties: spec.properties.clone(),
            dependencies: spec.depends_on.clone(),
        }
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ResourceState {
        self.status.state
    }

    /// Returns true if the resource is `running`.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.status.state, ResourceState::Running)
    }

    /// Records what was applied from `spec`.
    pub fn apply_spec(&mut self, spec: &ResourceSpec) {
        self.resource_type.clone_from(&spec.resource_type);
        self.provider.clone_from(&spec.provider);
        self.properties = spec.properties.clone();
        self.dependencies = spec.depends_on.clone();
    }
}

impl State {
    /// Creates a new empty state for an environment.
    #[must_use]
    pub fn new(environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            environment: environment.to_string(),
            last_update: None,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Gets a resource record by name.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Returns true if the named resource is `running`.
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.resources.get(name).is_some_and(ResourceRecord::is_running)
    }

    /// Returns the records that count as currently deployed.
    pub fn running(&self) -> impl Iterator<Item = (&String, &ResourceRecord)> {
        self.resources.iter().filter(|(_, r)| r.is_running())
    }

    /// Moves a resource to a new lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidTransition` if the move is not allowed or
    /// the resource has no record.
    pub fn transition(
        &mut self,
        name: &str,
        to: ResourceState,
        message: impl Into<String>,
    ) -> Result<&mut ResourceRecord, StateError> {
        let Some(record) = self.resources.get_mut(name) else {
            return Err(StateError::InvalidTransition {
                resource: name.to_string(),
                from: String::from("absent"),
                to: to.to_string(),
            });
        };

        if !record.status.state.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                resource: name.to_string(),
                from: record.status.state.to_string(),
                to: to.to_string(),
            });
        }

        record.status = ResourceStatus::new(to, message);
        Ok(record)
    }

    /// Puts a resource into `pending` ahead of its creation.
    ///
    /// A `failed` or `deleted` record is moved to `pending`. A record left in
    /// `pending` or `creating` by an interrupted run is replaced.
    pub fn schedule_create(&mut self, name: &str, spec: &ResourceSpec) {
        match self.resources.get_mut(name) {
            Some(record) if record.status.state.can_transition_to(ResourceState::Pending) => {
                record.status = ResourceStatus::new(ResourceState::Pending, "scheduled for creation");
                record.apply_spec(spec);
            }
            Some(record) => {
                debug!(resource = name, state = %record.status.state, "Replacing orphaned record");
                *record = ResourceRecord::pending(spec);
            }
            None => {
                self.resources.insert(name.to_string(), ResourceRecord::pending(spec));
            }
        }
    }

    /// Adds a history entry, keeping only the most recent [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: DeploymentHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Counts resources per lifecycle state.
    #[must_use]
    pub fn summary(&self) -> BTreeMap<ResourceState, usize> {
        let mut summary = BTreeMap::new();
        for record in self.resources.values() {
            *summary.entry(record.status.state).or_insert(0) += 1;
        }
        summary
    }
}

impl DeploymentHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(
        operation: DeploymentOperation,
        config_hash: &str,
        version: Option<String>,
        resources: Vec<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            version,
            resources,
            success: true,
            error: None,
        }
    }

    /// Marks the entry as failed with an error message.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        };
        write!(f, "{state}")
    }
}

impl std::fmt::Display for DeploymentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Deploy => "deploy",
            Self::Rollback => "rollback",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropertyValue;

    fn spec(name: &str) -> ResourceSpec {
        let mut spec = ResourceSpec::new(name, "instance", "local");
        spec.properties
            .insert(String::from("image"), PropertyValue::from("web:1"));
        spec
    }

    #[test]
    fn test_transition_table() {
        use ResourceState::{Creating, Deleted, Failed, Pending, Running};

        assert!(Pending.can_transition_to(Creating));
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Failed));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Deleted));
        assert!(Failed.can_transition_to(Pending));
        assert!(Deleted.can_transition_to(Creating));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Deleted.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Deleted));
    }

    #[test]
    fn test_pending_to_running_rejected() {
        let mut state = State::new("dev");
        state.schedule_create("web", &spec("web"));

        let err = state
            .transition("web", ResourceState::Running, "")
            .expect_err("pending -> running must be rejected");
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        state
            .transition("web", ResourceState::Creating, "")
            .expect("pending -> creating");
        state
            .transition("web", ResourceState::Running, "")
            .expect("creating -> running");
        assert!(state.is_running("web"));
    }

    #[test]
    fn test_schedule_create_reuses_failed_record() {
        let mut state = State::new("dev");
        state.schedule_create("web", &spec("web"));
        state.transition("web", ResourceState::Creating, "").expect("creating");
        state.transition("web", ResourceState::Failed, "boom").expect("failed");

        state.schedule_create("web", &spec("web"));
        assert_eq!(state.record("web").map(ResourceRecord::state), Some(ResourceState::Pending));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = State::new("dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(DeploymentHistoryEntry::new(
                DeploymentOperation::Deploy,
                &format!("hash-{i}"),
                None,
                Vec::new(),
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].config_hash, "hash-5");
    }

    #[test]
    fn test_record_serializes_flat() {
        let mut state = State::new("dev");
        state.schedule_create("web", &spec("web"));

        let json = serde_json::to_value(&state).expect("serialize");
        let web = &json["resources"]["web"];
        assert_eq!(web["state"], "pending");
        assert_eq!(web["type"], "instance");
        assert_eq!(web["provider"], "local");
        assert_eq!(web["properties"]["image"], "web:1");
        assert!(json["last_update"].is_null());
    }
}
