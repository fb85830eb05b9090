//! Execution results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::PropertyMap;
use crate::error::{ProviderError, ResourceFailure};
use crate::planner::{Plan, PropertyChange};
use crate::state::State;

use super::phase::DeploymentPhase;

/// Outcome of a completed execution or rollback.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    /// Environment name.
    pub environment: String,
    /// Phase reached.
    pub phase: DeploymentPhase,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Resources created.
    pub created: Vec<String>,
    /// Resources updated in place.
    pub updated: Vec<String>,
    /// Resources deleted.
    pub deleted: Vec<String>,
    /// Provider outputs of the resources touched, by resource name.
    pub outputs: BTreeMap<String, PropertyMap>,
    /// Deploy version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// What a failed execution managed to do.
///
/// This is the input to rollback.
#[derive(Debug, Clone, Serialize)]
pub struct PartialFailure {
    /// The executed plan.
    #[serde(skip)]
    pub plan: Plan,
    /// Environment name.
    pub environment: String,
    /// Resources created before the failure.
    pub created: Vec<String>,
    /// Resources updated before the failure.
    pub updated: Vec<String>,
    /// Resources deleted before the failure.
    pub deleted: Vec<String>,
    /// Operations that failed.
    pub failures: Vec<ResourceFailure>,
    /// Planned resources never started.
    pub not_started: Vec<String>,
    /// Whether the deadline expired.
    pub timed_out: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// State as loaded at the start of execution.
    #[serde(skip)]
    pub snapshot: State,
    /// `last_update` of the state execution left behind.
    #[serde(skip)]
    pub left_at: Option<DateTime<Utc>>,
}

/// Result of [`crate::orchestrator::Orchestrator::execute`].
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Every planned change was applied and committed.
    Succeeded(DeploymentResult),
    /// Execution stopped after a failure or deadline expiry.
    PartiallyFailed(Box<PartialFailure>),
}

/// Summary of a full deploy.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    /// Environment name.
    pub environment: String,
    /// Final phase: `committed` or `rolled_back`.
    pub phase: DeploymentPhase,
    /// The executed plan.
    pub plan: Plan,
    /// Execution result when the deploy succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DeploymentResult>,
    /// What failed, when the deploy was rolled back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<PartialFailure>,
    /// Rollback result, when the deploy was rolled back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<DeploymentResult>,
    /// Operator backup written before execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// How a provider's view of a resource compares with its record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "drift", rename_all = "snake_case")]
pub enum Drift {
    /// Properties match the record.
    InSync,
    /// The provider no longer has the resource.
    Missing,
    /// The provider reports different properties.
    Changed {
        /// Recorded (`before`) against observed (`after`) values.
        changes: Vec<PropertyChange>,
    },
    /// The provider could not be asked.
    Unreachable {
        /// Error returned by the provider.
        message: String,
    },
}

impl Drift {
    /// Returns true unless the resource is in sync.
    #[must_use]
    pub const fn is_drifted(&self) -> bool {
        !matches!(self, Self::InSync)
    }
}

/// A recorded resource as its provider currently reports it.
#[derive(Debug, Clone, Serialize)]
pub struct ObservedResource {
    /// Resource name.
    pub name: String,
    /// Provider-assigned id.
    pub id: String,
    /// Provider binding.
    pub provider: String,
    /// Status reported by the provider, when it answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Comparison with the record.
    pub drift: Drift,
}

impl PartialFailure {
    /// Returns the first failure as a provider error naming the environment,
    /// resource and operation.
    #[must_use]
    pub fn to_provider_error(&self) -> ProviderError {
        self.failures.first().map_or_else(
            || ProviderError::OperationFailed {
                environment: self.environment.clone(),
                resource: String::new(),
                operation: String::from("execute"),
                message: String::from("execution stopped"),
            },
            |failure| ProviderError::OperationFailed {
                environment: failure.environment.clone(),
                resource: failure.resource.clone(),
                operation: failure.operation.clone(),
                message: failure.message.clone(),
            },
        )
    }
}

impl DeployReport {
    /// Returns true if the deploy was committed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.phase == DeploymentPhase::Committed
    }
}

impl std::fmt::Display for DeploymentResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} '{}' in {}ms: {} created, {} updated, {} deleted",
            self.phase,
            self.environment,
            self.duration_ms,
            self.created.len(),
            self.updated.len(),
            self.deleted.len()
        )
    }
}

pub(crate) fn millis(elapsed: std::time::Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
