//! Planning module for deployment operations.
//!
//! This module compares desired resource specs with the recorded state of an
//! environment and produces the ordered plan of creations, in-place updates
//! and deletions that reconciles them.

mod diff;
mod plan;

pub use diff::{property_diff, ChangeAction, PropertyChange};
pub use plan::{ConfirmedPlan, Plan, PlannedChange};

use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::config::{ConfigHasher, ResourceSpec};
use crate::error::{ConfigError, DependencyError, Result};
use crate::graph::ResourceGraph;
use crate::provider::ProviderRegistry;
use crate::state::{ResourceRecord, State};

/// Diffs desired specs against recorded state.
#[derive(Debug, Default)]
pub struct Planner {
    hasher: ConfigHasher,
}

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Checks a desired spec set before planning.
    ///
    /// Verifies unique names, dependency references, acyclicity, that every
    /// provider resolves and initializes, and each spec against its
    /// provider's schema. No resource is touched.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError`, `DependencyError` or `ProviderError` for the
    /// first problem found.
    pub async fn validate(
        &self,
        environment: &str,
        desired: &[ResourceSpec],
        registry: &ProviderRegistry,
    ) -> Result<()> {
        let mut seen = BTreeSet::new();
        for spec in desired {
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    environment: environment.to_string(),
                    name: spec.name.clone(),
                }
                .into());
            }
        }

        ResourceGraph::check_references(desired)?;
        ResourceGraph::new(desired).build_order()?;

        let providers: BTreeSet<&str> = desired.iter().map(|s| s.provider.as_str()).collect();
        for name in providers {
            registry.ensure_initialized(name).await?;
        }

        for spec in desired {
            let provider = registry.resolve(&spec.provider)?;
            let schema = provider.schema(&spec.resource_type).ok_or_else(|| ConfigError::Schema {
                resource: spec.name.clone(),
                resource_type: spec.resource_type.clone(),
                provider: spec.provider.clone(),
                message: format!(
                    "resource type '{}' is not managed by this provider",
                    spec.resource_type
                ),
            })?;
            schema.validate(spec)?;
        }

        debug!(environment, resources = desired.len(), "Desired specs validated");
        Ok(())
    }

    /// Computes the plan reconciling `current` with `desired`.
    ///
    /// Only `running` records count as deployed. Records left `failed`,
    /// `pending`, `creating` or `deleted` are treated as absent, so those
    /// resources are offered for creation again.
    ///
    /// # Errors
    ///
    /// Returns `DependencyError` for unresolved references or cycles, and
    /// `ConfigError::ImmutableField` when the type or provider of a deployed
    /// resource changes.
    pub fn diff(&self, current: &State, desired: &[ResourceSpec]) -> Result<Plan> {
        ResourceGraph::check_references(desired)?;
        let desired_graph = ResourceGraph::new(desired);
        desired_graph.build_order()?;

        let current_graph = ResourceGraph::from_edges(
            current
                .running()
                .map(|(name, record)| (name.as_str(), record.dependencies.iter().map(String::as_str))),
        );

        let mut adds = Vec::new();
        let mut updates = Vec::new();
        let mut unchanged = 0;

        for spec in desired {
            match current.record(&spec.name).filter(|r| r.is_running()) {
                None => {
                    debug!(resource = %spec.name, "Resource needs to be created");
                    adds.push(PlannedChange {
                        name: spec.name.clone(),
                        action: ChangeAction::Create,
                        spec: Some(spec.clone()),
                        previous: current.record(&spec.name).cloned(),
                        changes: property_diff(&Default::default(), &spec.properties),
                    });
                }
                Some(record) => {
                    Self::check_immutable(spec, record)?;

                    let changes = property_diff(&record.properties, &spec.properties);
                    let rewired = !same_dependencies(&record.dependencies, &spec.depends_on);
                    if changes.is_empty() && !rewired {
                        unchanged += 1;
                        continue;
                    }

                    debug!(
                        resource = %spec.name,
                        changed = changes.len(),
                        rewired,
                        "Resource needs update"
                    );
                    updates.push(PlannedChange {
                        name: spec.name.clone(),
                        action: ChangeAction::Update,
                        spec: Some(spec.clone()),
                        previous: Some(record.clone()),
                        changes,
                    });
                }
            }
        }

        let desired_names: BTreeSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();
        let deletes: Vec<PlannedChange> = current
            .running()
            .filter(|(name, _)| !desired_names.contains(name.as_str()))
            .map(|(name, record)| {
                debug!(resource = %name, "Resource no longer desired");
                PlannedChange {
                    name: name.clone(),
                    action: ChangeAction::Delete,
                    spec: None,
                    previous: Some(record.clone()),
                    changes: property_diff(&record.properties, &Default::default()),
                }
            })
            .collect();

        let add_order = desired_graph
            .restricted(adds.iter().map(|c| c.name.as_str()))
            .build_order()?;
        let update_order = desired_graph
            .restricted(updates.iter().map(|c| c.name.as_str()))
            .build_order()?;
        let delete_order = current_graph
            .restricted(deletes.iter().map(|c| c.name.as_str()))
            .build_reverse_order()?;

        let plan = Plan {
            environment: current.environment.clone(),
            created_at: Utc::now(),
            based_on: current.last_update,
            config_hash: self.hasher.hash_specs(desired),
            add_resources: Self::ordered(adds, &add_order)?,
            update_resources: Self::ordered(updates, &update_order)?,
            delete_resources: Self::ordered(deletes, &delete_order)?,
            unchanged,
            desired_graph,
            current_graph,
        };
        plan.verify_creation_order(current)?;

        info!(
            environment = %plan.environment,
            add = plan.add_resources.len(),
            update = plan.update_resources.len(),
            delete = plan.delete_resources.len(),
            unchanged = plan.unchanged,
            "Plan computed"
        );
        Ok(plan)
    }

    fn check_immutable(spec: &ResourceSpec, record: &ResourceRecord) -> Result<()> {
        for (field, from, to) in [
            ("type", &record.resource_type, &spec.resource_type),
            ("provider", &record.provider, &spec.provider),
        ] {
            if from != to {
                return Err(ConfigError::ImmutableField {
                    resource: spec.name.clone(),
                    field: field.to_string(),
                    from: from.clone(),
                    to: to.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Sorts changes by a graph order covering exactly their names.
    fn ordered(mut changes: Vec<PlannedChange>, order: &[String]) -> Result<Vec<PlannedChange>> {
        let mut sorted = Vec::with_capacity(changes.len());
        for name in order {
            let index = changes.iter().position(|c| &c.name == name).ok_or_else(|| {
                crate::error::DeployError::internal(format!("ordered resource '{name}' has no change"))
            })?;
            sorted.push(changes.swap_remove(index));
        }

        if let Some(change) = changes.first() {
            return Err(DependencyError::Unresolved {
                resource: change.name.clone(),
                dependency: String::from("<unordered>"),
            }
            .into());
        }
        Ok(sorted)
    }
}

fn same_dependencies(recorded: &[String], desired: &[String]) -> bool {
    let recorded: BTreeSet<&str> = recorded.iter().map(String::as_str).collect();
    let desired: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
    recorded == desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropertyMap;
    use crate::error::DeployError;
    use crate::provider::MemoryProvider;
    use crate::state::{ResourceState, ResourceStatus};
    use std::sync::Arc;

    fn spec(name: &str, image: &str) -> ResourceSpec {
        ResourceSpec::new(name, "instance", "mem").with_property("image", image)
    }

    fn record(spec: &ResourceSpec, state: ResourceState) -> ResourceRecord {
        let mut record = ResourceRecord::pending(spec);
        record.status = ResourceStatus::new(state, "");
        record.id = Some(format!("id-{}", spec.name));
        record
    }

    fn state_with(records: &[(&ResourceSpec, ResourceState)]) -> State {
        let mut state = State::new("staging");
        for (spec, resource_state) in records {
            state
                .resources
                .insert(spec.name.clone(), record(spec, *resource_state));
        }
        state
    }

    fn names(changes: &[PlannedChange]) -> Vec<&str> {
        changes.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_staging_add_and_update() {
        let current = state_with(&[(&spec("web", "web:1"), ResourceState::Running)]);
        let desired = vec![spec("web", "web:2"), ResourceSpec::new("db", "database", "mem")];

        let plan = Planner::new().diff(&current, &desired).expect("plan");

        assert_eq!(names(&plan.add_resources), vec!["db"]);
        assert_eq!(names(&plan.update_resources), vec!["web"]);
        assert!(plan.delete_resources.is_empty());
        assert_eq!(plan.update_resources[0].changes[0].key, "image");
    }

    #[test]
    fn test_unchanged_is_idempotent() {
        let web = spec("web", "web:1");
        let db = ResourceSpec::new("db", "database", "mem").with_property("engine", "postgres");
        let current = state_with(&[(&web, ResourceState::Running), (&db, ResourceState::Running)]);

        let plan = Planner::new().diff(&current, &[db, web]).expect("plan");

        assert!(plan.is_empty());
        assert_eq!(plan.unchanged, 2);
    }

    #[test]
    fn test_dependency_only_change_is_an_update() {
        let db = ResourceSpec::new("db", "database", "mem");
        let web = spec("web", "web:1");
        let current = state_with(&[(&web, ResourceState::Running), (&db, ResourceState::Running)]);

        let plan = Planner::new()
            .diff(&current, &[db.clone(), web.clone().with_dependency("db")])
            .expect("plan");
        assert_eq!(names(&plan.update_resources), vec!["web"]);
        assert!(plan.update_resources[0].changes.is_empty());
        assert_eq!(plan.unchanged, 1);

        let rewired = state_with(&[
            (&web.clone().with_dependency("db"), ResourceState::Running),
            (&db, ResourceState::Running),
        ]);
        let plan = Planner::new()
            .diff(&rewired, &[db, web.with_dependency("db")])
            .expect("plan");
        assert!(plan.is_empty());
    }

    #[test]
    fn test_partition_has_no_overlap() {
        let current = state_with(&[
            (&spec("a", "1"), ResourceState::Running),
            (&spec("b", "1"), ResourceState::Running),
            (&spec("c", "1"), ResourceState::Failed),
        ]);
        let desired = vec![spec("b", "2"), spec("c", "1"), spec("d", "1")];

        let plan = Planner::new().diff(&current, &desired).expect("plan");

        assert_eq!(names(&plan.add_resources), vec!["c", "d"]);
        assert_eq!(names(&plan.update_resources), vec!["b"]);
        assert_eq!(names(&plan.delete_resources), vec!["a"]);

        let mut all: Vec<&str> = plan.changes().map(|c| c.name.as_str()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn test_failed_and_interrupted_records_are_re_added() {
        let current = state_with(&[
            (&spec("failed", "1"), ResourceState::Failed),
            (&spec("stuck", "1"), ResourceState::Creating),
            (&spec("gone", "1"), ResourceState::Deleted),
        ]);
        let desired = vec![spec("failed", "1"), spec("stuck", "1"), spec("gone", "1")];

        let plan = Planner::new().diff(&current, &desired).expect("plan");

        assert_eq!(names(&plan.add_resources), vec!["failed", "gone", "stuck"]);
        assert!(plan.add_resources[0].previous.is_some());
        assert!(plan.delete_resources.is_empty());
    }

    #[test]
    fn test_add_order_follows_dependencies() {
        let desired = vec![
            spec("web", "1").with_dependency("db").with_dependency("cache"),
            ResourceSpec::new("db", "database", "mem").with_dependency("net"),
            ResourceSpec::new("net", "network", "mem"),
            spec("cache", "1"),
        ];

        let plan = Planner::new().diff(&State::new("staging"), &desired).expect("plan");

        assert_eq!(names(&plan.add_resources), vec!["cache", "net", "db", "web"]);
    }

    #[test]
    fn test_delete_order_is_reversed() {
        let net = ResourceSpec::new("net", "network", "mem");
        let db = ResourceSpec::new("db", "database", "mem").with_dependency("net");
        let web = spec("web", "1").with_dependency("db");
        let current = state_with(&[
            (&net, ResourceState::Running),
            (&db, ResourceState::Running),
            (&web, ResourceState::Running),
        ]);

        let plan = Planner::new().diff(&current, &[]).expect("plan");

        assert_eq!(names(&plan.delete_resources), vec!["web", "db", "net"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let desired = vec![
            spec("a", "1").with_dependency("b"),
            spec("b", "1").with_dependency("a"),
        ];

        let err = Planner::new()
            .diff(&State::new("staging"), &desired)
            .expect_err("cycle");
        assert!(matches!(
            err,
            DeployError::Dependency(DependencyError::Cycle { ref participants }) if participants == &["a", "b"]
        ));
    }

    #[test]
    fn test_type_change_is_rejected() {
        let current = state_with(&[(&spec("web", "1"), ResourceState::Running)]);
        let desired = vec![ResourceSpec::new("web", "database", "mem")];

        let err = Planner::new().diff(&current, &desired).expect_err("immutable");
        assert!(matches!(
            err,
            DeployError::Config(ConfigError::ImmutableField { ref field, .. }) if field == "type"
        ));
    }

    #[test]
    fn test_creation_order_violation() {
        let db = ResourceSpec::new("db", "database", "mem");
        let current = state_with(&[(&db, ResourceState::Running)]);
        let mut plan = Planner::new()
            .diff(&current, &[db.clone(), spec("web", "1").with_dependency("db")])
            .expect("plan");
        assert!(plan.verify_creation_order(&current).is_ok());

        plan.delete_resources.push(PlannedChange {
            name: String::from("db"),
            action: ChangeAction::Delete,
            spec: None,
            previous: None,
            changes: Vec::new(),
        });
        assert!(matches!(
            plan.verify_creation_order(&current),
            Err(DependencyError::CreationOrder { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_checks_providers_and_schemas() {
        let mut registry = ProviderRegistry::new();
        registry.register("mem", Arc::new(MemoryProvider::new("mem")));
        let planner = Planner::new();

        let valid = vec![spec("web", "web:1")];
        assert!(planner.validate("staging", &valid, &registry).await.is_ok());

        let unknown_provider = vec![ResourceSpec::new("web", "instance", "aws")];
        assert!(matches!(
            planner.validate("staging", &unknown_provider, &registry).await,
            Err(DeployError::Provider(_))
        ));

        let mut props = PropertyMap::new();
        props.insert(String::from("image"), 42_i64.into());
        let mut mistyped = ResourceSpec::new("web", "instance", "mem");
        mistyped.properties = props;
        assert!(matches!(
            planner.validate("staging", &[mistyped], &registry).await,
            Err(DeployError::Config(ConfigError::Schema { .. }))
        ));

        let unknown_type = vec![ResourceSpec::new("q", "queue", "mem")];
        assert!(matches!(
            planner.validate("staging", &unknown_type, &registry).await,
            Err(DeployError::Config(ConfigError::Schema { .. }))
        ));

        let duplicated = vec![spec("web", "1"), spec("web", "2")];
        assert!(matches!(
            planner.validate("staging", &duplicated, &registry).await,
            Err(DeployError::Config(ConfigError::DuplicateName { .. }))
        ));
    }
}
