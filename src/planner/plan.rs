//! Deployment plan types.
//!
//! A plan is the immutable result of diffing desired specs against a state
//! snapshot. It is confirmed once and then consumed by exactly one execution.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::ResourceSpec;
use crate::error::DependencyError;
use crate::graph::ResourceGraph;
use crate::state::{ResourceRecord, State};

use super::diff::{ChangeAction, PropertyChange};

/// A complete deployment plan for one environment.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Environment the plan applies to.
    pub environment: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// `last_update` of the state the plan was computed against.
    pub based_on: Option<DateTime<Utc>>,
    /// Hash of the desired spec set.
    pub config_hash: String,
    /// Resources to create, in dependency order.
    pub add_resources: Vec<PlannedChange>,
    /// Resources to update in place, in dependency order.
    pub update_resources: Vec<PlannedChange>,
    /// Resources to delete, dependents first.
    pub delete_resources: Vec<PlannedChange>,
    /// Number of desired resources left untouched.
    pub unchanged: usize,
    /// Dependency graph of the desired specs.
    #[serde(skip)]
    pub(crate) desired_graph: ResourceGraph,
    /// Dependency graph recorded in the state snapshot.
    #[serde(skip)]
    pub(crate) current_graph: ResourceGraph,
}

/// A single planned change.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    /// Resource name.
    pub name: String,
    /// Kind of change.
    pub action: ChangeAction,
    /// Desired spec; absent for deletions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<ResourceSpec>,
    /// Record in the planning snapshot, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<ResourceRecord>,
    /// Per-property before/after values.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<PropertyChange>,
}

/// A plan the caller has accepted for execution.
#[derive(Debug, Clone)]
pub struct ConfirmedPlan {
    plan: Plan,
    confirmed_at: DateTime<Utc>,
}

impl Plan {
    /// Returns true if the plan contains no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add_resources.is_empty()
            && self.update_resources.is_empty()
            && self.delete_resources.is_empty()
    }

    /// Returns the total number of changes.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.add_resources.len() + self.update_resources.len() + self.delete_resources.len()
    }

    /// Iterates over every change: adds, then updates, then deletes.
    pub fn changes(&self) -> impl Iterator<Item = &PlannedChange> {
        self.add_resources
            .iter()
            .chain(&self.update_resources)
            .chain(&self.delete_resources)
    }

    /// Finds the change planned for a resource.
    #[must_use]
    pub fn change(&self, name: &str) -> Option<&PlannedChange> {
        self.changes().find(|c| c.name == name)
    }

    /// Returns the names of the resources to create, in order.
    #[must_use]
    pub fn add_names(&self) -> Vec<&str> {
        self.add_resources.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns the names of the resources to update, in order.
    #[must_use]
    pub fn update_names(&self) -> Vec<&str> {
        self.update_resources.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns the names of the resources to delete, in order.
    #[must_use]
    pub fn delete_names(&self) -> Vec<&str> {
        self.delete_resources.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns the desired dependency graph.
    #[must_use]
    pub const fn desired_graph(&self) -> &ResourceGraph {
        &self.desired_graph
    }

    /// Returns the dependency graph recorded in the planning snapshot.
    #[must_use]
    pub const fn current_graph(&self) -> &ResourceGraph {
        &self.current_graph
    }

    /// Checks that every resource to create has its dependencies in place.
    ///
    /// A dependency is in place if it is `running` in `current` and not
    /// planned for deletion, or if it is created earlier in this plan.
    ///
    /// # Errors
    ///
    /// Returns `DependencyError::CreationOrder` for the first violation.
    pub fn verify_creation_order(&self, current: &State) -> Result<(), DependencyError> {
        let deleted: BTreeSet<&str> = self.delete_names().into_iter().collect();
        let mut created: BTreeSet<&str> = BTreeSet::new();

        for change in &self.add_resources {
            let Some(spec) = &change.spec else {
                continue;
            };
            for dependency in &spec.depends_on {
                let running = current.is_running(dependency) && !deleted.contains(dependency.as_str());
                if !running && !created.contains(dependency.as_str()) {
                    return Err(DependencyError::CreationOrder {
                        resource: change.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            created.insert(change.name.as_str());
        }

        Ok(())
    }

    /// Accepts the plan for execution.
    #[must_use]
    pub fn confirm(self) -> ConfirmedPlan {
        ConfirmedPlan {
            plan: self,
            confirmed_at: Utc::now(),
        }
    }
}

impl ConfirmedPlan {
    /// Returns the confirmed plan.
    #[must_use]
    pub const fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Returns when the plan was confirmed.
    #[must_use]
    pub const fn confirmed_at(&self) -> DateTime<Utc> {
        self.confirmed_at
    }

    /// Unwraps the plan.
    #[must_use]
    pub fn into_plan(self) -> Plan {
        self.plan
    }
}

impl PlannedChange {
    /// Returns a human-readable description of the change.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            ChangeAction::Create => format!("Create '{}'", self.name),
            ChangeAction::Update => format!(
                "Update '{}' ({} propert{})",
                self.name,
                self.changes.len(),
                if self.changes.len() == 1 { "y" } else { "ies" }
            ),
            ChangeAction::Delete => format!("Delete '{}'", self.name),
        }
    }

    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        self.spec
            .as_ref()
            .map(|s| s.resource_type.as_str())
            .or_else(|| self.previous.as_ref().map(|r| r.resource_type.as_str()))
            .unwrap_or_default()
    }

    /// Returns the provider name.
    #[must_use]
    pub fn provider(&self) -> &str {
        self.spec
            .as_ref()
            .map(|s| s.provider.as_str())
            .or_else(|| self.previous.as_ref().map(|r| r.provider.as_str()))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action.symbol(), self.name)?;
        let resource_type = self.resource_type();
        if !resource_type.is_empty() {
            write!(f, " ({resource_type})")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes for '{}'", self.environment);
        }

        writeln!(
            f,
            "Plan for '{}': {} to add, {} to update, {} to delete",
            self.environment,
            self.add_resources.len(),
            self.update_resources.len(),
            self.delete_resources.len()
        )?;
        for change in self.changes() {
            writeln!(f, "  {change}")?;
            for property in &change.changes {
                writeln!(f, "      {property}")?;
            }
        }

        Ok(())
    }
}
