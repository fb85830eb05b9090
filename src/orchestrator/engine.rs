//! Plan execution engine.
//!
//! The orchestrator runs a confirmed plan in three phases (create, update,
//! delete). Each phase drives a bounded pool of provider operations; a
//! resource starts only once every in-phase predecessor has finished. The
//! coordinating loop is the only code that touches the state: it records
//! `pending` and `creating` before a creation starts and applies completions
//! one at a time, persisting after each, so a crash loses at most the
//! in-flight statuses.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::{PropertyMap, ResourceSpec};
use crate::error::{DeployError, ProviderError, ResourceFailure, Result, RollbackError};
use crate::graph::ResourceGraph;
use crate::planner::{property_diff, ChangeAction, ConfirmedPlan, Plan, PlannedChange, Planner};
use crate::provider::{Provider, ProviderRegistry, Resource};
use crate::state::{
    validate_environment_name, DeploymentHistoryEntry, DeploymentOperation, LockInfo,
    ResourceRecord, ResourceState, State, StateStore,
};

use super::options::{DeployOptions, ExecuteOptions};
use super::phase::DeploymentPhase;
use super::result::{
    millis, DeployReport, DeploymentResult, Drift, ExecutionOutcome, ObservedResource,
    PartialFailure,
};

/// Drives plans against providers.
pub struct Orchestrator<'a> {
    store: &'a dyn StateStore,
    registry: &'a ProviderRegistry,
    planner: Planner,
    span: Span,
}

/// Provider call handed to a worker.
enum Work {
    Create(ResourceSpec),
    Update(String, ResourceSpec),
    Delete(Option<String>),
}

/// A finished worker.
struct Completion {
    name: String,
    action: ChangeAction,
    result: Result<Option<Resource>>,
}

/// Operations in flight during a phase.
struct Pool {
    tasks: JoinSet<Completion>,
    names: HashMap<task::Id, String>,
}

impl Pool {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            names: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn running(&self) -> impl Iterator<Item = &String> {
        self.names.values()
    }

    fn spawn(
        &mut self,
        name: String,
        action: ChangeAction,
        operation: impl Future<Output = Result<Option<Resource>>> + Send + 'static,
    ) {
        let key = name.clone();
        let handle = self.tasks.spawn(async move {
            Completion {
                result: operation.await,
                name,
                action,
            }
        });
        self.names.insert(handle.id(), key);
    }

    /// Waits for the next operation. A panicked operation completes with
    /// an internal error.
    async fn next(&mut self, action: ChangeAction) -> Option<Completion> {
        let joined = self.tasks.join_next_with_id().await?;
        Some(match joined {
            Ok((id, completion)) => {
                self.names.remove(&id);
                completion
            }
            Err(e) => {
                let name = self.names.remove(&e.id()).unwrap_or_default();
                Completion {
                    name,
                    action,
                    result: Err(DeployError::internal(format!("operation aborted: {e}"))),
                }
            }
        })
    }
}

/// Progress of one execution.
struct Run {
    environment: String,
    state: State,
    created: Vec<String>,
    updated: Vec<String>,
    deleted: Vec<String>,
    failures: Vec<ResourceFailure>,
    not_started: Vec<String>,
    overdue: Vec<String>,
    outputs: BTreeMap<String, PropertyMap>,
    halted: bool,
    timed_out: bool,
}

impl Run {
    fn new(environment: &str, state: State) -> Self {
        Self {
            environment: environment.to_string(),
            state,
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            failures: Vec::new(),
            not_started: Vec::new(),
            overdue: Vec::new(),
            outputs: BTreeMap::new(),
            halted: false,
            timed_out: false,
        }
    }

    /// Records a failed operation and stops new work.
    fn fail(&mut self, resource: &str, operation: &str, message: &str) {
        error!(
            environment = %self.environment,
            resource,
            operation,
            error = message,
            "Resource operation failed"
        );
        self.failures.push(ResourceFailure {
            environment: self.environment.clone(),
            resource: resource.to_string(),
            operation: operation.to_string(),
            message: message.to_string(),
        });
        if let Err(e) = self.state.transition(resource, ResourceState::Failed, message) {
            warn!(resource, error = %e, "Could not mark resource failed");
        }
        self.halted = true;
    }

    fn mark_deleted(&mut self, name: &str, message: &str) -> Result<()> {
        self.state.transition(name, ResourceState::Deleted, message)?;
        self.state.outputs.remove(name);
        info!(environment = %self.environment, resource = name, "Resource deleted");
        self.deleted.push(name.to_string());
        Ok(())
    }

    fn record_outputs(&mut self, name: &str, outputs: PropertyMap) {
        if outputs.is_empty() {
            self.state.outputs.remove(name);
        } else {
            self.state.outputs.insert(name.to_string(), outputs.clone());
            self.outputs.insert(name.to_string(), outputs);
        }
    }
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator over a state store and provider registry.
    #[must_use]
    pub fn new(store: &'a dyn StateStore, registry: &'a ProviderRegistry) -> Self {
        Self {
            store,
            registry,
            planner: Planner::new(),
            span: info_span!("orchestrator", backend = store.backend_type()),
        }
    }

    /// Sets the span every operation is recorded under.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &'a dyn StateStore {
        self.store
    }

    /// Returns the provider registry.
    #[must_use]
    pub const fn registry(&self) -> &'a ProviderRegistry {
        self.registry
    }

    /// Computes the plan for an environment.
    ///
    /// Validates the desired specs (providers are initialized on the way),
    /// then holds the environment lock only while reading state.
    ///
    /// # Errors
    ///
    /// Returns `LockConflict`, `ConfigError`, `DependencyError` or
    /// `ProviderError`.
    pub async fn plan(&self, environment: &str, desired: &[ResourceSpec]) -> Result<Plan> {
        let span = info_span!(parent: &self.span, "plan", environment);
        async move {
            validate_environment_name(environment)?;
            self.planner.validate(environment, desired, self.registry).await?;

            let lock = self.store.lock(environment).await?;
            let plan = async {
                let state = self.store.load(environment).await?;
                self.planner.diff(&state, desired)
            }
            .await;
            self.release(environment, &lock).await;

            plan
        }
        .instrument(span)
        .await
    }

    /// Executes a confirmed plan.
    ///
    /// A provider failure or deadline expiry is not an error: it yields
    /// [`ExecutionOutcome::PartiallyFailed`], the input to
    /// [`Orchestrator::rollback`]. The lock is released on every path.
    ///
    /// # Errors
    ///
    /// Returns `LockConflict`, `StalePlanError` (state changed since the plan
    /// was computed, no provider is called) or `StateError`.
    pub async fn execute(
        &self,
        confirmed: ConfirmedPlan,
        options: &ExecuteOptions,
    ) -> Result<ExecutionOutcome> {
        let plan = confirmed.into_plan();
        let environment = plan.environment.clone();
        let span = info_span!(parent: &self.span, "execute", environment = %environment);

        async move {
            let lock = self.store.lock(&environment).await?;
            let outcome = self.execute_locked(plan, options).await;
            self.release(&environment, &lock).await;
            outcome
        }
        .instrument(span)
        .await
    }

    /// Reverses what a failed execution applied.
    ///
    /// Created and updated resources are reversed in strict reverse
    /// dependency order, then resources deleted by the run are recreated in
    /// dependency order. On success the pre-execution snapshot is persisted
    /// (recreated resources carry their new ids).
    ///
    /// # Errors
    ///
    /// Returns `StalePlanError` if the state changed since the execution,
    /// and `RollbackError` listing every reversal that failed; the actual
    /// state is persisted in that case. The lock is always released.
    pub async fn rollback(&self, partial: &PartialFailure) -> Result<DeploymentResult> {
        let span = info_span!(parent: &self.span, "rollback", environment = %partial.environment);

        async move {
            let lock = self.store.lock(&partial.environment).await?;
            let result = self.rollback_locked(partial).await;
            self.release(&partial.environment, &lock).await;
            result
        }
        .instrument(span)
        .await
    }

    /// Plans, confirms and applies in one call.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::plan`] and [`Orchestrator::apply`].
    pub async fn deploy(
        &self,
        environment: &str,
        desired: &[ResourceSpec],
        options: &DeployOptions,
    ) -> Result<DeployReport> {
        let plan = self.plan(environment, desired).await?;
        self.apply(plan.confirm(), options).await
    }

    /// Applies a confirmed plan, rolling back on partial failure.
    ///
    /// A rolled back deploy is reported, not raised: the report's phase is
    /// `rolled_back`.
    ///
    /// # Errors
    ///
    /// Returns the execution errors of [`Orchestrator::execute`], a
    /// `ProviderError` for the first failure when automatic rollback is
    /// disabled, or the error of a failed rollback.
    pub async fn apply(&self, confirmed: ConfirmedPlan, options: &DeployOptions) -> Result<DeployReport> {
        let plan = confirmed.plan().clone();
        let environment = plan.environment.clone();

        let backup = if options.backup && plan.based_on.is_some() && !plan.is_empty() {
            Some(self.store.backup(&environment, None).await?)
        } else {
            None
        };

        match self.execute(confirmed, &options.execute).await? {
            ExecutionOutcome::Succeeded(result) => Ok(DeployReport {
                environment,
                phase: result.phase,
                plan,
                result: Some(result),
                failure: None,
                rollback: None,
                backup,
            }),
            ExecutionOutcome::PartiallyFailed(partial) => {
                if !options.auto_rollback {
                    warn!(environment = %environment, "Automatic rollback disabled, state left as applied");
                    return Err(partial.to_provider_error().into());
                }

                warn!(
                    environment = %environment,
                    failures = partial.failures.len(),
                    "Deployment partially failed, rolling back"
                );
                let rollback = self.rollback(&partial).await?;

                Ok(DeployReport {
                    environment,
                    phase: rollback.phase,
                    plan,
                    result: None,
                    failure: Some(*partial),
                    rollback: Some(rollback),
                    backup,
                })
            }
        }
    }

    /// Loads the state of an environment without locking it.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid environment name or unreadable state.
    pub async fn status(&self, environment: &str) -> Result<State> {
        validate_environment_name(environment)?;
        self.store.load(environment).await
    }

    /// Asks the provider of every `running` record what it holds now.
    ///
    /// Nothing is locked or written; drift is reported, not repaired.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid environment name or unreadable state.
    /// Provider failures are reported per resource as
    /// [`Drift::Unreachable`].
    pub async fn observe(&self, environment: &str) -> Result<Vec<ObservedResource>> {
        let span = info_span!(parent: &self.span, "observe", environment);
        async move {
            let state = self.status(environment).await?;
            let mut observed = Vec::new();

            for (name, record) in state.running() {
                let Some(id) = record.id.clone() else {
                    continue;
                };

                let (status, drift) = match self.fetch(&record.provider, &id).await {
                    Ok(resource) => {
                        let changes = property_diff(&record.properties, &resource.properties);
                        let drift = if changes.is_empty() {
                            Drift::InSync
                        } else {
                            Drift::Changed { changes }
                        };
                        (Some(resource.status), drift)
                    }
                    Err(DeployError::Provider(ProviderError::ResourceNotFound { .. })) => {
                        (None, Drift::Missing)
                    }
                    Err(e) => (
                        None,
                        Drift::Unreachable {
                            message: e.to_string(),
                        },
                    ),
                };

                if drift.is_drifted() {
                    warn!(resource = %name, id = %id, ?drift, "Resource drifted from recorded state");
                }
                observed.push(ObservedResource {
                    name: name.clone(),
                    id,
                    provider: record.provider.clone(),
                    status,
                    drift,
                });
            }

            debug!(resources = observed.len(), "Resources observed");
            Ok(observed)
        }
        .instrument(span)
        .await
    }

    async fn fetch(&self, provider: &str, id: &str) -> Result<Resource> {
        let provider = self.registry.ensure_initialized(provider).await?;
        provider.get_resource(id).await
    }

    async fn release(&self, environment: &str, lock: &LockInfo) {
        if let Err(e) = self.store.unlock(environment, lock).await {
            error!(environment, error = %e, "Failed to release environment lock");
        }
    }

    async fn persist(&self, run: &mut Run) -> Result<()> {
        self.store.save(&run.environment, &mut run.state).await
    }

    async fn execute_locked(&self, plan: Plan, options: &ExecuteOptions) -> Result<ExecutionOutcome> {
        let environment = plan.environment.clone();
        let state = self.store.load(&environment).await?;

        if state.last_update != plan.based_on {
            warn!(environment = %environment, "State changed since planning");
            return Err(DeployError::StalePlan {
                environment,
                planned_against: stamp(plan.based_on),
                found: stamp(state.last_update),
            });
        }

        let started = Instant::now();
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);
        let parallelism = options.parallelism.max(1);
        let snapshot = state.clone();
        let mut run = Run::new(&environment, state);
        let mut phase = DeploymentPhase::Confirmed.transition(DeploymentPhase::Executing)?;

        info!(
            environment = %environment,
            changes = plan.change_count(),
            parallelism,
            "Executing plan"
        );

        let phases = [
            (
                ChangeAction::Create,
                &plan.add_resources,
                forward_predecessors(plan.desired_graph(), &plan.add_resources),
            ),
            (
                ChangeAction::Update,
                &plan.update_resources,
                forward_predecessors(plan.desired_graph(), &plan.update_resources),
            ),
            (
                ChangeAction::Delete,
                &plan.delete_resources,
                reverse_predecessors(plan.current_graph(), &plan.delete_resources),
            ),
        ];

        for (action, changes, predecessors) in &phases {
            if changes.is_empty() {
                continue;
            }
            if run.halted {
                run.not_started.extend(changes.iter().map(|c| c.name.clone()));
                continue;
            }

            debug!(phase = %action, resources = changes.len(), "Starting phase");
            self.run_phase(&mut run, *action, changes, predecessors, parallelism, deadline)
                .await?;
        }

        if run.timed_out {
            let (resource, detail) = match run.not_started.first() {
                Some(first) => (
                    first.clone(),
                    format!("{} operation(s) not started", run.not_started.len()),
                ),
                None => {
                    let overdue = run.overdue.first().cloned().unwrap_or_default();
                    let detail = format!("'{overdue}' was still in flight");
                    (overdue, detail)
                }
            };
            run.failures.push(ResourceFailure {
                environment: environment.clone(),
                resource,
                operation: String::from("timeout"),
                message: format!(
                    "deadline of {:?} expired; {detail}",
                    options.timeout.unwrap_or_default()
                ),
            });
        }

        let entry = DeploymentHistoryEntry::new(
            DeploymentOperation::Deploy,
            &plan.config_hash,
            options.version.clone(),
            plan.changes().map(|c| c.name.clone()).collect(),
        );

        if run.failures.is_empty() {
            phase = phase.transition(DeploymentPhase::Succeeded)?;
            if !plan.is_empty() {
                run.state.add_history(entry);
                self.persist(&mut run).await?;
            }
            phase = phase.transition(DeploymentPhase::Committed)?;

            let result = DeploymentResult {
                environment,
                phase,
                duration_ms: millis(started.elapsed()),
                created: run.created,
                updated: run.updated,
                deleted: run.deleted,
                outputs: run.outputs,
                version: options.version.clone(),
            };
            info!(environment = %result.environment, "{result}");
            return Ok(ExecutionOutcome::Succeeded(result));
        }

        phase.transition(DeploymentPhase::PartiallyFailed)?;
        let summary = run
            .failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        run.state.add_history(entry.failed(summary));
        self.persist(&mut run).await?;

        warn!(
            environment = %environment,
            created = run.created.len(),
            updated = run.updated.len(),
            deleted = run.deleted.len(),
            failed = run.failures.len(),
            not_started = run.not_started.len(),
            "Execution partially failed"
        );

        Ok(ExecutionOutcome::PartiallyFailed(Box::new(PartialFailure {
            environment,
            created: run.created,
            updated: run.updated,
            deleted: run.deleted,
            failures: run.failures,
            not_started: run.not_started,
            timed_out: run.timed_out,
            duration_ms: millis(started.elapsed()),
            snapshot,
            left_at: run.state.last_update,
            plan,
        })))
    }

    /// Runs one phase with at most `parallelism` operations in flight.
    ///
    /// An error stops new work, but operations already started are awaited
    /// and recorded before it is returned.
    async fn run_phase(
        &self,
        run: &mut Run,
        action: ChangeAction,
        changes: &[PlannedChange],
        predecessors: &BTreeMap<String, BTreeSet<String>>,
        parallelism: usize,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<()> {
        let mut waiting: Vec<&PlannedChange> = changes.iter().collect();
        let mut finished: BTreeSet<String> = BTreeSet::new();
        let mut pool = Pool::new();
        let mut fatal: Option<DeployError> = None;

        loop {
            let remaining = !waiting.is_empty() || !pool.is_empty();
            if remaining && !run.halted && deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                warn!(environment = %run.environment, "Deadline expired, no new operations start");
                run.halted = true;
                run.timed_out = true;
                let mut overdue: Vec<String> = pool.running().cloned().collect();
                overdue.sort();
                run.overdue.extend(overdue);
            }

            while !run.halted && pool.len() < parallelism {
                let ready = waiting.iter().position(|change| {
                    predecessors
                        .get(&change.name)
                        .is_none_or(|preds| preds.iter().all(|p| finished.contains(p)))
                });
                let Some(index) = ready else {
                    break;
                };
                let change = waiting.remove(index);
                if let Err(e) = self.launch(run, action, change, &mut pool).await {
                    run.halted = true;
                    fatal = Some(e);
                }
            }

            if pool.is_empty() {
                break;
            }

            let next = match deadline {
                Some(deadline) if !run.halted => {
                    tokio::select! {
                        next = pool.next(action) => next,
                        () = tokio::time::sleep_until(deadline) => continue,
                    }
                }
                _ => pool.next(action).await,
            };
            let Some(completion) = next else {
                break;
            };

            let name = completion.name.clone();
            match self.complete(run, completion, changes).await {
                Ok(true) => {
                    finished.insert(name);
                }
                Ok(false) => {}
                Err(e) if fatal.is_some() => {
                    error!(resource = %name, error = %e, "Could not record completed operation");
                }
                Err(e) => {
                    run.halted = true;
                    fatal = Some(e);
                }
            }
        }

        run.not_started
            .extend(waiting.into_iter().map(|c| c.name.clone()));

        match fatal {
            Some(e) => {
                error!(environment = %run.environment, error = %e, "Phase aborted after in-flight operations finished");
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Records the start of an operation and spawns it.
    async fn launch(
        &self,
        run: &mut Run,
        action: ChangeAction,
        change: &PlannedChange,
        pool: &mut Pool,
    ) -> Result<()> {
        let name = change.name.clone();
        let operation = action.to_string();

        let provider = match self.registry.resolve(change.provider()) {
            Ok(provider) => provider,
            Err(e) => {
                run.fail(&name, &operation, &e.to_string());
                return self.persist(run).await;
            }
        };

        let recorded_id = run.state.record(&name).and_then(|r| r.id.clone());
        let work = match (action, &change.spec) {
            (ChangeAction::Create, Some(spec)) => {
                run.state.schedule_create(&name, spec);
                run.state
                    .transition(&name, ResourceState::Creating, "creating")?;
                self.persist(run).await?;
                Work::Create(spec.clone())
            }
            (ChangeAction::Update, Some(spec)) => {
                let Some(id) = recorded_id else {
                    run.fail(&name, &operation, "no provider id recorded");
                    return self.persist(run).await;
                };
                Work::Update(id, spec.clone())
            }
            (ChangeAction::Delete, _) => {
                if recorded_id.is_none() {
                    warn!(resource = %name, "No provider id recorded, nothing to delete");
                }
                Work::Delete(recorded_id)
            }
            (_, None) => {
                return Err(DeployError::internal(format!(
                    "{operation} of '{name}' planned without a spec"
                )));
            }
        };

        debug!(resource = %name, operation = %operation, "Starting operation");
        let span = info_span!("resource", resource = %name, operation = %operation);
        pool.spawn(name, action, perform(provider, work).instrument(span));

        Ok(())
    }

    /// Applies a finished operation to the state and persists it.
    ///
    /// Returns true if the operation succeeded.
    async fn complete(
        &self,
        run: &mut Run,
        completion: Completion,
        changes: &[PlannedChange],
    ) -> Result<bool> {
        let Completion {
            name,
            action,
            result,
        } = completion;
        let spec = changes
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.spec.as_ref());

        let succeeded = match (action, result) {
            (ChangeAction::Create, Ok(Some(resource))) => {
                let record = run.state.transition(&name, ResourceState::Running, "created")?;
                record.id = Some(resource.id.clone());
                run.record_outputs(&name, resource.outputs);
                info!(resource = %name, id = %resource.id, "Resource created");
                run.created.push(name);
                true
            }
            (ChangeAction::Update, Ok(resource)) => {
                let record = run.state.transition(&name, ResourceState::Running, "updated")?;
                if let Some(spec) = spec {
                    record.apply_spec(spec);
                }
                if let Some(resource) = resource {
                    record.id = Some(resource.id);
                    run.record_outputs(&name, resource.outputs);
                }
                info!(resource = %name, "Resource updated");
                run.updated.push(name);
                true
            }
            (ChangeAction::Delete, Ok(_)) => {
                run.mark_deleted(&name, "deleted")?;
                true
            }
            (ChangeAction::Delete, Err(DeployError::Provider(ProviderError::ResourceNotFound { id }))) => {
                warn!(resource = %name, id = %id, "Resource already gone, treating as deleted");
                run.mark_deleted(&name, "already absent")?;
                true
            }
            (ChangeAction::Create, Ok(None)) => {
                run.fail(&name, "create", "provider returned no resource");
                false
            }
            (action, Err(e)) => {
                run.fail(&name, &action.to_string(), &e.to_string());
                false
            }
        };

        self.persist(run).await?;
        Ok(succeeded)
    }

    async fn rollback_locked(&self, partial: &PartialFailure) -> Result<DeploymentResult> {
        let environment = &partial.environment;
        let mut state = self.store.load(environment).await?;

        if state.last_update != partial.left_at {
            return Err(DeployError::StalePlan {
                environment: environment.clone(),
                planned_against: stamp(partial.left_at),
                found: stamp(state.last_update),
            });
        }

        let started = Instant::now();
        let plan = &partial.plan;
        let mut target = partial.snapshot.clone();
        let mut failures = Vec::new();
        let mut removed = Vec::new();
        let mut reverted = Vec::new();
        let mut recreated = Vec::new();
        let mut outputs = BTreeMap::new();

        info!(
            environment = %environment,
            created = partial.created.len(),
            updated = partial.updated.len(),
            deleted = partial.deleted.len(),
            "Rolling back"
        );

        let applied = partial.created.iter().chain(&partial.updated).map(String::as_str);
        let applied_graph = plan.desired_graph().restricted(applied);
        let reverse_order = applied_graph.build_reverse_order()?;
        let mut blocked: BTreeSet<String> = BTreeSet::new();

        for name in &reverse_order {
            let created = partial.created.contains(name);
            let operation = if created { "delete" } else { "update" };

            let dependent = applied_graph
                .dependents_of(name)
                .find(|d| blocked.contains(*d))
                .map(str::to_string);
            if let Some(dependent) = dependent {
                warn!(resource = %name, dependent = %dependent, "Rollback step skipped");
                failures.push(ResourceFailure {
                    environment: environment.clone(),
                    resource: name.clone(),
                    operation: operation.to_string(),
                    message: format!("not reversed: dependent '{dependent}' is still in place"),
                });
                blocked.insert(name.clone());
                continue;
            }

            let outcome = if created {
                self.undo_create(&state, name).await
            } else {
                self.undo_update(&state, &partial.snapshot, name).await
            };

            match outcome {
                Ok(()) if created => {
                    set_status(&mut state, name, ResourceState::Deleted, "removed by rollback");
                    state.outputs.remove(name);
                    removed.push(name.clone());
                }
                Ok(()) => {
                    if let Some(previous) = partial.snapshot.record(name) {
                        state.resources.insert(name.clone(), previous.clone());
                    }
                    reverted.push(name.clone());
                }
                Err(e) => {
                    error!(resource = %name, operation, error = %e, "Rollback step failed");
                    blocked.insert(name.clone());
                    set_status(&mut state, name, ResourceState::Failed, &format!("rollback failed: {e}"));
                    failures.push(ResourceFailure {
                        environment: environment.clone(),
                        resource: name.clone(),
                        operation: operation.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let deleted = partial.deleted.iter().map(String::as_str);
        let deleted_graph = plan.current_graph().restricted(deleted);
        let forward_order = deleted_graph.build_order()?;
        let mut missing: BTreeSet<String> = BTreeSet::new();

        for name in &forward_order {
            let Some(previous) = partial.snapshot.record(name) else {
                continue;
            };

            let dependency = deleted_graph
                .dependencies_of(name)
                .find(|d| missing.contains(*d))
                .map(str::to_string);
            if let Some(dependency) = dependency {
                warn!(resource = %name, dependency = %dependency, "Rollback step skipped");
                failures.push(ResourceFailure {
                    environment: environment.clone(),
                    resource: name.clone(),
                    operation: String::from("create"),
                    message: format!("not recreated: dependency '{dependency}' is missing"),
                });
                missing.insert(name.clone());
                continue;
            }
            let spec = spec_of(name, previous);

            let outcome = match self.registry.resolve(&previous.provider) {
                Ok(provider) => provider.create_resource(&spec).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(resource) => {
                    let mut record = previous.clone();
                    record.id = Some(resource.id.clone());
                    if let Some(restored) = target.resources.get_mut(name) {
                        restored.id = Some(resource.id.clone());
                    }
                    if !resource.outputs.is_empty() {
                        target.outputs.insert(name.clone(), resource.outputs.clone());
                        outputs.insert(name.clone(), resource.outputs);
                    }
                    state.resources.insert(name.clone(), record);
                    info!(resource = %name, id = %resource.id, "Resource recreated");
                    recreated.push(name.clone());
                }
                Err(e) => {
                    error!(resource = %name, operation = "create", error = %e, "Rollback step failed");
                    missing.insert(name.clone());
                    failures.push(ResourceFailure {
                        environment: environment.clone(),
                        resource: name.clone(),
                        operation: String::from("create"),
                        message: e.to_string(),
                    });
                }
            }
        }

        let touched: Vec<String> = reverse_order.iter().chain(&forward_order).cloned().collect();
        let entry = DeploymentHistoryEntry::new(
            DeploymentOperation::Rollback,
            &plan.config_hash,
            None,
            touched,
        );

        if !failures.is_empty() {
            state.add_history(entry.failed(format!("{} reversal(s) failed", failures.len())));
            self.store.save(environment, &mut state).await?;
            return Err(RollbackError {
                environment: environment.clone(),
                failures,
            }
            .into());
        }

        target.history = state.history;
        target.add_history(entry);
        self.store.save(environment, &mut target).await?;

        let phase = DeploymentPhase::PartiallyFailed.transition(DeploymentPhase::RolledBack)?;
        let result = DeploymentResult {
            environment: environment.clone(),
            phase,
            duration_ms: millis(started.elapsed()),
            created: recreated,
            updated: reverted,
            deleted: removed,
            outputs,
            version: None,
        };
        info!(environment = %environment, "{result}");
        Ok(result)
    }

    async fn undo_create(&self, state: &State, name: &str) -> Result<()> {
        let record = state
            .record(name)
            .ok_or_else(|| DeployError::internal(format!("no record for created resource '{name}'")))?;
        let Some(id) = &record.id else {
            return Ok(());
        };

        let provider = self.registry.resolve(&record.provider)?;
        match provider.delete_resource(id).await {
            Err(DeployError::Provider(ProviderError::ResourceNotFound { .. })) => {
                warn!(resource = name, id = %id, "Created resource already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn undo_update(&self, state: &State, snapshot: &State, name: &str) -> Result<()> {
        let previous = snapshot
            .record(name)
            .ok_or_else(|| DeployError::internal(format!("no snapshot record for '{name}'")))?;
        let id = state
            .record(name)
            .and_then(|r| r.id.clone())
            .or_else(|| previous.id.clone())
            .ok_or_else(|| DeployError::internal(format!("no provider id for '{name}'")))?;

        let provider = self.registry.resolve(&previous.provider)?;
        provider.update_resource(&id, &spec_of(name, previous)).await.map(|_| ())
    }
}

impl std::fmt::Debug for Orchestrator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.store.backend_type())
            .field("registry", self.registry)
            .finish_non_exhaustive()
    }
}

async fn perform(provider: Arc<dyn Provider>, work: Work) -> Result<Option<Resource>> {
    match work {
        Work::Create(spec) => provider.create_resource(&spec).await.map(Some),
        Work::Update(id, spec) => provider.update_resource(&id, &spec).await.map(Some),
        Work::Delete(Some(id)) => provider.delete_resource(&id).await.map(|()| None),
        Work::Delete(None) => Ok(None),
    }
}

/// In-phase predecessors for creations and updates: a resource's
/// dependencies.
fn forward_predecessors(
    graph: &ResourceGraph,
    changes: &[PlannedChange],
) -> BTreeMap<String, BTreeSet<String>> {
    let subgraph = graph.restricted(changes.iter().map(|c| c.name.as_str()));
    changes
        .iter()
        .map(|c| {
            let preds = subgraph.dependencies_of(&c.name).map(str::to_string).collect();
            (c.name.clone(), preds)
        })
        .collect()
}

/// In-phase predecessors for deletions: a resource's dependents.
fn reverse_predecessors(
    graph: &ResourceGraph,
    changes: &[PlannedChange],
) -> BTreeMap<String, BTreeSet<String>> {
    let subgraph = graph.restricted(changes.iter().map(|c| c.name.as_str()));
    changes
        .iter()
        .map(|c| {
            let preds = subgraph.dependents_of(&c.name).map(str::to_string).collect();
            (c.name.clone(), preds)
        })
        .collect()
}

fn spec_of(name: &str, record: &ResourceRecord) -> ResourceSpec {
    ResourceSpec {
        name: name.to_string(),
        resource_type: record.resource_type.clone(),
        provider: record.provider.clone(),
        properties: record.properties.clone(),
        depends_on: record.dependencies.clone(),
    }
}

fn set_status(state: &mut State, name: &str, to: ResourceState, message: &str) {
    if let Err(e) = state.transition(name, to, message) {
        warn!(resource = name, error = %e, "Could not record rollback status");
    }
}

fn stamp(time: Option<DateTime<Utc>>) -> String {
    time.map_or_else(
        || String::from("none"),
        |t| t.to_rfc3339_opts(SecondsFormat::Micros, true),
    )
}
