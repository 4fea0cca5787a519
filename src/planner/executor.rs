//! Plan executor.
//!
//! Steps run concurrently up to the configured parallelism; a step starts
//! only once every step it depends on has succeeded. Each completed plugin
//! operation is committed to the state store before anything that depends
//! on it starts, so an interrupted apply loses at most the operations that
//! were in flight.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::address::ResourceAddress;
use crate::config::{ApplyConfig, ResourceRef};
use crate::error::{ProviderError, Result, StateError, TerraceError};
use crate::provider::{AttributeChanges, PluginRegistry, ReadResult, ResourcePlugin};
use crate::schema::{AttributeMap, AttributeValue, ResourceSchema};
use crate::state::{ResourceInstance, StateSnapshot, StateStore};

use super::plan::{Action, Plan, PlannedChange};
use super::retry::RetryPolicy;

/// Executor settings.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Maximum steps in flight.
    pub parallelism: usize,
    /// Keep running independent steps after a failure.
    pub continue_on_error: bool,
    /// Retry policy for plugin operations.
    pub retry: RetryPolicy,
    /// Deadline for a single plugin operation.
    pub operation_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&ApplyConfig::default())
    }
}

impl From<&ApplyConfig> for ExecutorOptions {
    fn from(config: &ApplyConfig) -> Self {
        Self {
            parallelism: config.parallelism,
            continue_on_error: config.continue_on_error,
            retry: RetryPolicy::from(config),
            operation_timeout: Duration::from_secs(config.operation_timeout_secs),
        }
    }
}

/// Final status of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The change was applied and committed.
    Applied,
    /// Nothing needed doing.
    NoOp,
    /// The step failed.
    Failed,
    /// Not run because a dependency did not succeed or apply halted.
    Skipped,
    /// Not run because apply was cancelled.
    Cancelled,
}

impl OutcomeStatus {
    /// True for statuses that let dependents proceed.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Applied | Self::NoOp)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Applied => "applied",
            Self::NoOp => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of one plan step.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeOutcome {
    /// Index of the step in the plan.
    pub index: usize,
    /// Resource the step applied to.
    pub address: ResourceAddress,
    /// Planned action.
    pub action: Action,
    /// What happened.
    pub status: OutcomeStatus,
    /// Provider id the resource ended up with, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Error detail for failed, skipped and cancelled steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Plugin calls made, retries included.
    pub attempts: u32,
}

impl ChangeOutcome {
    fn not_run(index: usize, change: &PlannedChange, status: OutcomeStatus, reason: &str) -> Self {
        Self {
            index,
            address: change.address.clone(),
            action: change.action,
            status,
            provider_id: None,
            error: Some(reason.to_string()),
            attempts: 0,
        }
    }
}

/// Result of applying a plan.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// One outcome per plan step, in plan order.
    pub outcomes: Vec<ChangeOutcome>,
    /// State as last committed.
    pub final_state: StateSnapshot,
    /// Apply was cancelled before every step ran.
    pub cancelled: bool,
}

impl ApplyReport {
    /// True if every step applied or was a no-op.
    #[must_use]
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    /// Number of outcomes with the given status.
    #[must_use]
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Outcomes of failed steps.
    pub fn failures(&self) -> impl Iterator<Item = &ChangeOutcome> {
        self.outcomes.iter().filter(|o| o.status == OutcomeStatus::Failed)
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Apply finished: {} applied, {} unchanged, {} failed, {} skipped, {} cancelled",
            self.count(OutcomeStatus::Applied),
            self.count(OutcomeStatus::NoOp),
            self.count(OutcomeStatus::Failed),
            self.count(OutcomeStatus::Skipped),
            self.count(OutcomeStatus::Cancelled)
        )
    }
}

/// Applies plans against live infrastructure.
pub struct PlanExecutor {
    registry: PluginRegistry,
    store: Arc<dyn StateStore>,
    options: ExecutorOptions,
    cancel: CancellationToken,
}

impl PlanExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(registry: PluginRegistry, store: Arc<dyn StateStore>, options: ExecutorOptions) -> Self {
        Self {
            registry,
            store,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to stop issuing new operations.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this executor's applies.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Applies `plan` on top of `state`.
    ///
    /// Step failures are reported in the returned [`ApplyReport`], not as
    /// errors. The report's final state is what the store holds.
    ///
    /// # Errors
    ///
    /// Fails before running anything if `state` is not the state the plan
    /// was computed against, or a step's resource type has no plugin.
    pub async fn apply(&self, plan: &Plan, state: StateSnapshot) -> Result<ApplyReport> {
        if plan.state_serial != state.serial || plan.state_lineage != state.lineage {
            return Err(TerraceError::State(StateError::StalePlan {
                planned: plan.state_serial,
                current: state.serial,
            }));
        }
        if !plan.respects_dependencies() {
            return Err(TerraceError::internal("plan steps are not in dependency order"));
        }

        let plugins = plan
            .changes
            .iter()
            .map(|c| self.registry.require(&c.address.resource_type))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Applying {} change(s) with parallelism {}",
            plan.actionable().count(),
            self.options.parallelism
        );

        let changes = Arc::new(plan.changes.clone());
        let worker = Arc::new(Worker {
            store: Arc::clone(&self.store),
            state: Arc::new(Mutex::new(state)),
            retry: self.options.retry,
            timeout: self.options.operation_timeout,
            cancel: self.cancel.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));

        let total = changes.len();
        let mut outcomes: Vec<Option<ChangeOutcome>> = vec![None; total];
        let mut started = vec![false; total];
        let mut tasks: JoinSet<(usize, StepResult)> = JoinSet::new();
        let mut halted = false;

        loop {
            if !halted && !self.cancel.is_cancelled() {
                for index in 0..total {
                    if started[index] || outcomes[index].is_some() {
                        continue;
                    }
                    let change = &changes[index];
                    let dependency_failed = change
                        .depends_on
                        .iter()
                        .any(|d| outcomes[*d].as_ref().is_some_and(|o| !o.status.is_success()));
                    if dependency_failed {
                        warn!("Skipping {} {}: a dependency did not apply", change.action, change.address);
                        outcomes[index] = Some(ChangeOutcome::not_run(
                            index,
                            change,
                            OutcomeStatus::Skipped,
                            "a dependency did not apply",
                        ));
                        continue;
                    }
                    let ready = change
                        .depends_on
                        .iter()
                        .all(|d| outcomes[*d].as_ref().is_some_and(|o| o.status.is_success()));
                    if !ready {
                        continue;
                    }
                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        break;
                    };

                    started[index] = true;
                    let worker = Arc::clone(&worker);
                    let changes = Arc::clone(&changes);
                    let plugin = Arc::clone(&plugins[index]);
                    tasks.spawn(async move {
                        let _permit = permit;
                        let result = worker.run(&changes[index], plugin.as_ref()).await;
                        (index, result)
                    });
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((index, result)) => {
                    let change = &changes[index];
                    if result.status == OutcomeStatus::Failed {
                        error!(
                            "{} {} failed: {}",
                            change.action,
                            change.address,
                            result.error.as_deref().unwrap_or("unknown error")
                        );
                        if result.fatal || !self.options.continue_on_error {
                            halted = true;
                        }
                    }
                    outcomes[index] = Some(ChangeOutcome {
                        index,
                        address: change.address.clone(),
                        action: change.action,
                        status: result.status,
                        provider_id: result.provider_id,
                        error: result.error,
                        attempts: result.attempts,
                    });
                }
                Err(e) => {
                    error!("Apply task aborted: {e}");
                    halted = true;
                }
            }
        }

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            warn!("Apply cancelled; in-flight operations were allowed to finish");
        }
        let outcomes = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.unwrap_or_else(|| {
                    let change = &changes[index];
                    if started[index] {
                        ChangeOutcome::not_run(index, change, OutcomeStatus::Failed, "apply task aborted")
                    } else if cancelled {
                        ChangeOutcome::not_run(index, change, OutcomeStatus::Cancelled, "apply was cancelled")
                    } else {
                        ChangeOutcome::not_run(index, change, OutcomeStatus::Skipped, "apply halted after a failure")
                    }
                })
            })
            .collect();

        let final_state = worker.state.lock().await.clone();
        let report = ApplyReport {
            outcomes,
            final_state,
            cancelled,
        };
        info!("{report}");
        Ok(report)
    }
}

/// What a worker reports for one step.
struct StepResult {
    status: OutcomeStatus,
    provider_id: Option<String>,
    error: Option<String>,
    attempts: u32,
    fatal: bool,
}

enum StepError {
    /// The plugin operation failed; the step fails.
    Provider(ProviderError),
    /// Committing failed; nothing further may run.
    State(TerraceError),
}

impl From<TerraceError> for StepError {
    fn from(e: TerraceError) -> Self {
        Self::State(e)
    }
}

type StepOutput = std::result::Result<Option<String>, StepError>;

/// Runs single steps against the shared committed state.
struct Worker {
    store: Arc<dyn StateStore>,
    state: Arc<Mutex<StateSnapshot>>,
    retry: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(&self, change: &PlannedChange, plugin: &dyn ResourcePlugin) -> StepResult {
        debug!("Starting {} {}", change.action, change.address);
        let mut attempts = 0;
        let output = match change.action {
            Action::Create => self.create(change, plugin, &mut attempts, None).await,
            Action::Update => self.update(change, plugin, &mut attempts).await,
            Action::Delete => self.delete(change, plugin, &mut attempts).await,
            Action::Replace => self.replace(change, plugin, &mut attempts).await,
            Action::NoOp => self.noop(change).await,
        };

        match output {
            Ok(provider_id) => {
                let status = if change.action == Action::NoOp {
                    OutcomeStatus::NoOp
                } else {
                    info!("{} {} complete", change.action, change.address);
                    OutcomeStatus::Applied
                };
                StepResult {
                    status,
                    provider_id,
                    error: None,
                    attempts,
                    fatal: false,
                }
            }
            Err(StepError::Provider(e)) => StepResult {
                status: OutcomeStatus::Failed,
                provider_id: None,
                error: Some(TerraceError::resource(change.address.to_string(), e).to_string()),
                attempts,
                fatal: false,
            },
            Err(StepError::State(e)) => StepResult {
                status: OutcomeStatus::Failed,
                provider_id: None,
                error: Some(e.to_string()),
                attempts,
                fatal: true,
            },
        }
    }

    /// Calls a plugin operation under the retry policy.
    async fn call<T, F, Fut>(
        &self,
        change: &PlannedChange,
        operation: &str,
        attempts: &mut u32,
        f: F,
    ) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let name = format!("{operation} {}", change.address);
        let outcome = self.retry.run(&name, self.timeout, &self.cancel, f).await;
        *attempts += outcome.attempts;
        outcome.result
    }

    /// Applies `mutate` to a copy of the committed state and saves it.
    ///
    /// The shared state only changes once the save succeeded.
    async fn commit(&self, mutate: impl FnOnce(&mut StateSnapshot)) -> Result<()> {
        let mut current = self.state.lock().await;
        let mut next = current.clone();
        mutate(&mut next);
        next.bump();
        self.store.save(&next).await?;
        debug!(serial = next.serial, "Committed state");
        *current = next;
        Ok(())
    }

    async fn committed(&self, address: &ResourceAddress) -> Option<ResourceInstance> {
        self.state.lock().await.get(address).cloned()
    }

    /// Resolves the declared attributes against committed state.
    async fn resolve(&self, change: &PlannedChange, schema: &ResourceSchema) -> std::result::Result<AttributeMap, StepError> {
        let Some(desired) = &change.desired else {
            return Err(StepError::State(TerraceError::internal(format!(
                "{} has no declaration to apply",
                change.address
            ))));
        };

        let resolved = {
            let state = self.state.lock().await;
            let lookup = |reference: &ResourceRef| match state.get(&reference.address) {
                Some(instance) if reference.attribute == "id" => AttributeValue::string(instance.id.as_str()),
                Some(instance) => instance
                    .attributes
                    .get(&reference.attribute)
                    .cloned()
                    .unwrap_or(AttributeValue::Unknown),
                None => AttributeValue::Unknown,
            };
            desired.resolve(&lookup)
        };

        let unresolved: Vec<&str> = resolved
            .iter()
            .filter(|(_, value)| value.contains_unknown())
            .map(|(name, _)| name.as_str())
            .collect();
        if !unresolved.is_empty() {
            return Err(StepError::Provider(ProviderError::validation(format!(
                "unresolved reference in {}",
                unresolved.join(", ")
            ))));
        }

        schema
            .check_values(&resolved)
            .map_err(|problems| StepError::Provider(ProviderError::validation(problems.join("; "))))?;
        Ok(resolved)
    }

    /// Creates the resource. With `previous`, the old object is recorded as
    /// deposed in the same commit that records the new id.
    async fn create(
        &self,
        change: &PlannedChange,
        plugin: &dyn ResourcePlugin,
        attempts: &mut u32,
        previous: Option<ResourceInstance>,
    ) -> StepOutput {
        let schema = plugin.schema();
        let desired = self.resolve(change, schema).await?;
        let desired = &desired;
        let created = self
            .call(change, "create", attempts, move || plugin.create(desired))
            .await
            .map_err(StepError::Provider)?;
        let id = created.id;

        let mut instance = ResourceInstance::new(&change.address, id.as_str(), plugin.provider_name())
            .with_attributes(
                schema.version,
                merge_attributes(schema, &AttributeMap::new(), desired, created.attributes),
            )
            .with_dependencies(change.dependencies.clone());
        if let Some(old) = &previous {
            instance.deposed.clone_from(&old.deposed);
            instance.deposed.push(old.id.clone());
        }
        self.commit(|state| state.insert(instance)).await?;
        info!(id = %id, "Created {}", change.address);

        let id_ref = id.as_str();
        match self.call(change, "read", attempts, move || plugin.read(id_ref)).await {
            Ok(ReadResult::Found(live)) => {
                self.commit(|state| {
                    if let Some(instance) = state.get_mut(&change.address).filter(|i| i.id == id) {
                        instance.attributes = merge_attributes(schema, &instance.attributes, desired, live);
                    }
                })
                .await?;
                Ok(Some(id))
            }
            Ok(ReadResult::NotFound) => self.vanished_after_create(change, &id, previous).await,
            Err(e) if e.is_not_found() => self.vanished_after_create(change, &id, previous).await,
            Err(e) => Err(StepError::Provider(e)),
        }
    }

    async fn vanished_after_create(
        &self,
        change: &PlannedChange,
        id: &str,
        previous: Option<ResourceInstance>,
    ) -> StepOutput {
        warn!(id, "{} disappeared right after create", change.address);
        self.commit(|state| match previous {
            Some(old) => state.insert(old),
            None => {
                state.remove(&change.address);
            }
        })
        .await?;
        Err(StepError::Provider(ProviderError::not_found(id)))
    }

    async fn update(&self, change: &PlannedChange, plugin: &dyn ResourcePlugin, attempts: &mut u32) -> StepOutput {
        let schema = plugin.schema();
        let desired = self.resolve(change, schema).await?;
        let Some(prior) = self.committed(&change.address).await else {
            return Err(StepError::Provider(ProviderError::not_found(
                change.prior_id.clone().unwrap_or_default(),
            )));
        };

        let changes = attribute_changes(change, &prior.attributes, &desired);
        debug!(
            "Updating {} attribute(s) of {}, clearing {}",
            changes.set.len(),
            change.address,
            changes.removed.len()
        );

        let id = prior.id.as_str();
        let changes = &changes;
        match self.call(change, "update", attempts, move || plugin.update(id, changes)).await {
            Ok(live) => {
                let attributes = merge_attributes(schema, &prior.attributes, &desired, live);
                self.commit(|state| {
                    if let Some(instance) = state.get_mut(&change.address) {
                        instance.attributes = attributes;
                        instance.dependencies.clone_from(&change.dependencies);
                        instance.touch();
                    }
                })
                .await?;
                Ok(Some(prior.id.clone()))
            }
            Err(e) if e.is_not_found() => {
                warn!(id, "{} no longer exists; clearing it from state", change.address);
                self.commit(|state| {
                    state.remove(&change.address);
                })
                .await?;
                Err(StepError::Provider(e))
            }
            Err(e) => Err(StepError::Provider(e)),
        }
    }

    async fn delete(&self, change: &PlannedChange, plugin: &dyn ResourcePlugin, attempts: &mut u32) -> StepOutput {
        let Some(id) = change.prior_id.as_deref() else {
            return Err(StepError::State(TerraceError::internal(format!(
                "delete of {} has no provider id",
                change.address
            ))));
        };

        self.delete_object(change, plugin, attempts, id).await?;
        let deposed = change.deposed;
        self.commit(|state| {
            if deposed {
                if let Some(instance) = state.get_mut(&change.address) {
                    instance.deposed.retain(|d| d != id);
                }
            } else if state.get(&change.address).is_some_and(|i| i.id == id) {
                state.remove(&change.address);
            }
        })
        .await?;
        Ok(Some(id.to_string()))
    }

    /// Deletes one object. Already gone counts as deleted.
    async fn delete_object(
        &self,
        change: &PlannedChange,
        plugin: &dyn ResourcePlugin,
        attempts: &mut u32,
        id: &str,
    ) -> std::result::Result<(), StepError> {
        match self.call(change, "delete", attempts, move || plugin.delete(id)).await {
            Ok(()) => {
                info!(id, "Deleted {}", change.address);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(id, "{} was already gone", change.address);
                Ok(())
            }
            Err(e) => Err(StepError::Provider(e)),
        }
    }

    async fn replace(&self, change: &PlannedChange, plugin: &dyn ResourcePlugin, attempts: &mut u32) -> StepOutput {
        let previous = self.committed(&change.address).await;

        if change.create_before_destroy {
            let id = self.create(change, plugin, attempts, previous.clone()).await?;
            if let Some(old) = previous {
                self.delete_object(change, plugin, attempts, &old.id).await?;
                self.commit(|state| {
                    if let Some(instance) = state.get_mut(&change.address) {
                        instance.deposed.retain(|d| *d != old.id);
                    }
                })
                .await?;
            }
            return Ok(id);
        }

        if let Some(old) = previous {
            self.delete_object(change, plugin, attempts, &old.id).await?;
            self.commit(|state| {
                state.remove(&change.address);
            })
            .await?;
        }
        self.create(change, plugin, attempts, None).await
    }

    /// Records dependency changes; nothing is sent to the plugin.
    async fn noop(&self, change: &PlannedChange) -> StepOutput {
        let Some(instance) = self.committed(&change.address).await else {
            return Ok(None);
        };
        if instance.dependencies != change.dependencies {
            self.commit(|state| {
                if let Some(instance) = state.get_mut(&change.address) {
                    instance.dependencies.clone_from(&change.dependencies);
                }
            })
            .await?;
        }
        Ok(Some(instance.id))
    }
}

/// Splits an update into values to set and attributes to clear.
///
/// Planned names absent from the resolved declaration were removed from
/// configuration. Declared values that no longer match state are set even
/// when the plan did not name them, since references resolve at apply time.
fn attribute_changes(change: &PlannedChange, recorded: &AttributeMap, desired: &AttributeMap) -> AttributeChanges {
    let planned = change.diff.changed_attributes();
    let set = desired
        .iter()
        .filter(|(name, value)| planned.contains(*name) || recorded.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let removed = planned.into_iter().filter(|name| !desired.contains_key(name)).collect();
    AttributeChanges { set, removed }
}

/// Combines recorded, declared and live attributes into the value stored
/// after an operation. Live values win over declared ones. Values of
/// configurable attributes that are no longer declared are dropped, whether
/// recorded or reported back by the provider.
fn merge_attributes(
    schema: &ResourceSchema,
    recorded: &AttributeMap,
    desired: &AttributeMap,
    live: AttributeMap,
) -> AttributeMap {
    let mut merged: AttributeMap = recorded
        .iter()
        .filter(|(name, _)| desired.contains_key(*name) || schema.attribute(name).is_none_or(|a| a.computed))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    merged.extend(desired.iter().map(|(name, value)| (name.clone(), value.clone())));
    merged.extend(live.into_iter().filter(|(name, _)| {
        schema
            .attribute(name)
            .is_some_and(|a| a.computed || desired.contains_key(name))
    }));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeclaredResource, Expr};
    use crate::planner::plan::Planner;
    use crate::state::LocalStateStore;
    use crate::testing::{FakePlugin, MemoryStateStore, Op, attrs};

    const LB: &str = "fake_lb";

    fn addr(name: &str) -> ResourceAddress {
        ResourceAddress::new(LB, name)
    }

    fn lb(name: &str, algorithm: &str) -> DeclaredResource {
        DeclaredResource::literal(
            addr(name),
            attrs(&[
                ("name", AttributeValue::string(name)),
                ("algorithm", AttributeValue::string(algorithm)),
                ("region", AttributeValue::string("nyc1")),
            ]),
        )
    }

    fn with_droplets(mut resource: DeclaredResource, ids: &[i64]) -> DeclaredResource {
        resource.attributes.insert(
            String::from("droplet_ids"),
            Expr::Literal(AttributeValue::set(ids.iter().copied().map(AttributeValue::Int))),
        );
        resource
    }

    fn referencing(name: &str, target: &str, attribute: &str) -> DeclaredResource {
        let mut resource = lb(name, "round_robin");
        resource.attributes.insert(
            String::from("algorithm"),
            Expr::Reference(ResourceRef {
                address: addr(target),
                attribute: attribute.to_string(),
            }),
        );
        resource
    }

    struct Harness {
        plugin: Arc<FakePlugin>,
        registry: PluginRegistry,
        store: Arc<dyn StateStore>,
        options: ExecutorOptions,
    }

    impl Harness {
        fn new(plugin: FakePlugin) -> Self {
            Self::with_store(plugin, Arc::new(MemoryStateStore::new()))
        }

        fn with_store(plugin: FakePlugin, store: Arc<dyn StateStore>) -> Self {
            let plugin = Arc::new(plugin);
            let registry = PluginRegistry::new()
                .with_plugin(plugin.clone())
                .expect("register");
            Self {
                plugin,
                registry,
                store,
                options: ExecutorOptions {
                    parallelism: 1,
                    continue_on_error: false,
                    retry: RetryPolicy::immediate(3),
                    operation_timeout: Duration::from_secs(5),
                },
            }
        }

        fn executor(&self) -> PlanExecutor {
            PlanExecutor::new(self.registry.clone(), Arc::clone(&self.store), self.options)
        }

        async fn state(&self) -> StateSnapshot {
            self.store
                .load()
                .await
                .expect("load")
                .unwrap_or_else(|| StateSnapshot::new("p", "dev"))
        }

        async fn plan(&self, declared: &[DeclaredResource]) -> Plan {
            let state = self.state().await;
            Planner::new(&self.registry).plan(declared, &state, "h").expect("plan")
        }

        async fn apply_with(&self, executor: &PlanExecutor, declared: &[DeclaredResource]) -> ApplyReport {
            let state = self.state().await;
            let plan = Planner::new(&self.registry).plan(declared, &state, "h").expect("plan");
            executor.apply(&plan, state).await.expect("apply")
        }

        async fn apply(&self, declared: &[DeclaredResource]) -> ApplyReport {
            self.apply_with(&self.executor(), declared).await
        }
    }

    fn statuses(report: &ApplyReport) -> Vec<OutcomeStatus> {
        report.outcomes.iter().map(|o| o.status).collect()
    }

    #[tokio::test]
    async fn test_create_then_delete_load_balancer() {
        let h = Harness::new(FakePlugin::new(LB));

        let plan = h.plan(&[lb("web", "round_robin")]).await;
        assert_eq!(plan.count(Action::Create), 1);
        let report = h.apply(&[lb("web", "round_robin")]).await;
        assert!(report.success(), "{report:?}");
        assert_eq!(h.plugin.calls(Op::Create), 1);
        assert_eq!(h.plugin.calls(Op::Read), 1);

        let state = h.state().await;
        assert_eq!(state, report.final_state);
        let instance = state.get(&addr("web")).expect("tracked");
        assert!(!instance.id.is_empty());
        assert_eq!(instance.attributes["algorithm"], AttributeValue::string("round_robin"));
        assert_eq!(instance.attributes["region"], AttributeValue::string("nyc1"));
        assert!(instance.attributes.contains_key("ip"));

        let id = instance.id.clone();
        let plan = h.plan(&[]).await;
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].action, Action::Delete);
        assert_eq!(plan.changes[0].prior_id.as_deref(), Some(id.as_str()));

        let report = h.apply(&[]).await;
        assert!(report.success());
        assert!(h.plugin.live_ids().is_empty());
        assert!(h.state().await.resources.is_empty());
    }

    #[tokio::test]
    async fn test_second_apply_is_noop() {
        let h = Harness::new(FakePlugin::new(LB));
        h.apply(&[lb("web", "round_robin")]).await;

        let plan = h.plan(&[lb("web", "round_robin")]).await;
        assert!(plan.is_empty(), "{plan}");
        let report = h.apply(&[lb("web", "round_robin")]).await;
        assert_eq!(statuses(&report), vec![OutcomeStatus::NoOp]);
        assert_eq!(h.plugin.calls(Op::Create), 1);
    }

    #[tokio::test]
    async fn test_each_operation_committed() {
        let store = Arc::new(MemoryStateStore::new());
        let h = Harness::with_store(FakePlugin::new(LB), store.clone());
        h.apply(&[lb("a", "round_robin"), lb("b", "round_robin")]).await;

        // create and read-normalize commit separately for each resource
        assert_eq!(store.saves(), 4);
        assert_eq!(h.state().await.serial, 4);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let h = Harness::new(FakePlugin::new(LB));
        h.plugin.fail_next(Op::Create, ProviderError::transient("503 Service Unavailable"));

        let report = h.apply(&[lb("web", "round_robin")]).await;
        assert!(report.success());
        assert_eq!(h.plugin.calls(Op::Create), 2);
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(h.plugin.live_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_not_retried() {
        let h = Harness::new(FakePlugin::new(LB));
        h.plugin.fail_next(Op::Create, ProviderError::validation("unknown region"));

        let report = h.apply(&[lb("web", "round_robin")]).await;
        assert_eq!(statuses(&report), vec![OutcomeStatus::Failed]);
        assert_eq!(h.plugin.calls(Op::Create), 1);
        let error = report.outcomes[0].error.as_deref().expect("error");
        assert!(error.contains("fake_lb.web"), "{error}");
        assert!(h.state().await.resources.is_empty());
    }

    #[tokio::test]
    async fn test_failure_halts_remaining_steps() {
        let h = Harness::new(FakePlugin::new(LB));
        h.plugin.fail_next(Op::Create, ProviderError::api(422, "rejected"));

        let report = h.apply(&[lb("a", "round_robin"), lb("b", "round_robin")]).await;
        assert_eq!(statuses(&report), vec![OutcomeStatus::Failed, OutcomeStatus::Skipped]);
        assert_eq!(h.plugin.calls(Op::Create), 1);
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_independent_branches() {
        let mut h = Harness::new(FakePlugin::new(LB));
        h.options.continue_on_error = true;
        h.plugin.fail_next(Op::Create, ProviderError::api(422, "rejected"));

        let declared = [lb("a", "round_robin"), referencing("b", "a", "algorithm"), lb("c", "round_robin")];
        let report = h.apply(&declared).await;
        let by_name: Vec<(String, OutcomeStatus)> =
            report.outcomes.iter().map(|o| (o.address.name.clone(), o.status)).collect();
        assert_eq!(
            by_name,
            vec![
                (String::from("a"), OutcomeStatus::Failed),
                (String::from("b"), OutcomeStatus::Skipped),
                (String::from("c"), OutcomeStatus::Applied),
            ]
        );

        // rerun picks up exactly what did not commit
        let plan = h.plan(&declared).await;
        assert_eq!(plan.count(Action::Create), 2);
        assert_eq!(plan.count(Action::NoOp), 1);
    }

    #[tokio::test]
    async fn test_references_resolved_from_committed_state() {
        let mut h = Harness::new(FakePlugin::new(LB));
        h.options.parallelism = 4;

        let report = h.apply(&[referencing("front", "back", "ip"), lb("back", "round_robin")]).await;
        assert!(report.success(), "{report:?}");
        assert_eq!(h.plugin.events(), vec!["create:back", "create:front"]);

        let state = h.state().await;
        let back_ip = state.get(&addr("back")).expect("back").attributes["ip"].clone();
        assert_eq!(state.get(&addr("front")).expect("front").attributes["algorithm"], back_ip);
        assert!(state.get(&addr("front")).expect("front").dependencies.contains(&addr("back")));
    }

    #[tokio::test]
    async fn test_parallelism_bounds_in_flight_operations() {
        let mut h = Harness::new(FakePlugin::new(LB).with_latency(Duration::from_millis(20)));
        h.options.parallelism = 2;

        let declared: Vec<DeclaredResource> = ["a", "b", "c", "d"].iter().map(|n| lb(n, "round_robin")).collect();
        let report = h.apply(&declared).await;
        assert!(report.success());
        assert_eq!(h.plugin.max_in_flight(), 2);
        assert_eq!(h.state().await.resources.len(), 4);
    }

    #[tokio::test]
    async fn test_update_sends_only_changed_attributes() {
        let h = Harness::new(FakePlugin::new(LB));
        h.apply(&[lb("web", "round_robin")]).await;

        let desired = with_droplets(lb("web", "round_robin"), &[1001, 1002]);
        let plan = h.plan(std::slice::from_ref(&desired)).await;
        assert_eq!(plan.changes[0].action, Action::Update);

        let report = h.apply(&[desired]).await;
        assert!(report.success());
        let updates = h.plugin.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].set.keys().collect::<Vec<_>>(), vec!["droplet_ids"]);
        assert!(updates[0].removed.is_empty());

        let state = h.state().await;
        let droplets = state.get(&addr("web")).expect("web").attributes["droplet_ids"].clone();
        assert_eq!(droplets.as_set().map(crate::schema::ValueSet::len), Some(2));
    }

    #[tokio::test]
    async fn test_removed_optional_attribute_is_cleared() {
        let h = Harness::new(FakePlugin::new(LB));
        let mut described = lb("web", "round_robin");
        described.attributes.insert(
            String::from("description"),
            Expr::Literal(AttributeValue::string("frontend")),
        );
        assert!(h.apply(&[described]).await.success());
        let id = h.state().await.get(&addr("web")).expect("web").id.clone();
        assert!(h.plugin.live(&id).expect("live").contains_key("description"));

        let plan = h.plan(&[lb("web", "round_robin")]).await;
        assert_eq!(plan.changes[0].action, Action::Update);

        let report = h.apply(&[lb("web", "round_robin")]).await;
        assert!(report.success());
        let updates = h.plugin.updates();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].set.is_empty());
        assert!(updates[0].removed.contains("description"));

        assert!(!h.plugin.live(&id).expect("live").contains_key("description"));
        let state = h.state().await;
        assert!(!state.get(&addr("web")).expect("web").attributes.contains_key("description"));

        let plan = h.plan(&[lb("web", "round_robin")]).await;
        assert!(plan.is_empty(), "{plan}");
    }

    #[tokio::test]
    async fn test_update_of_vanished_resource_clears_it() {
        let h = Harness::new(FakePlugin::new(LB));
        h.apply(&[lb("web", "round_robin")]).await;
        let id = h.state().await.get(&addr("web")).expect("web").id.clone();
        h.plugin.remove_live(&id);

        let report = h.apply(&[with_droplets(lb("web", "round_robin"), &[7])]).await;
        assert_eq!(statuses(&report), vec![OutcomeStatus::Failed]);
        assert!(h.state().await.get(&addr("web")).is_none());

        let plan = h.plan(&[lb("web", "round_robin")]).await;
        assert_eq!(plan.changes[0].action, Action::Create);
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let h = Harness::new(FakePlugin::new(LB));
        h.apply(&[lb("web", "round_robin")]).await;
        let id = h.state().await.get(&addr("web")).expect("web").id.clone();
        h.plugin.remove_live(&id);

        let report = h.apply(&[]).await;
        assert_eq!(statuses(&report), vec![OutcomeStatus::Applied]);
        assert!(h.state().await.resources.is_empty());
    }

    #[tokio::test]
    async fn test_read_not_found_after_create_clears_instance() {
        let h = Harness::new(FakePlugin::new(LB));
        h.plugin.fail_next(Op::Read, ProviderError::not_found("gone"));

        let report = h.apply(&[lb("web", "round_robin")]).await;
        assert_eq!(statuses(&report), vec![OutcomeStatus::Failed]);
        assert!(h.state().await.resources.is_empty());
    }

    #[tokio::test]
    async fn test_replace_destroys_before_create() {
        let h = Harness::new(FakePlugin::new(LB));
        h.apply(&[lb("web", "round_robin")]).await;
        let old = h.state().await.get(&addr("web")).expect("web").id.clone();

        let report = h.apply(&[lb("web", "least_connections")]).await;
        assert!(report.success());
        assert_eq!(h.plugin.events(), vec!["create:web", "delete:web", "create:web"]);

        let state = h.state().await;
        let instance = state.get(&addr("web")).expect("web");
        assert_ne!(instance.id, old);
        assert_eq!(instance.attributes["algorithm"], AttributeValue::string("least_connections"));
        assert_eq!(h.plugin.live_ids(), vec![instance.id.clone()]);
    }

    #[tokio::test]
    async fn test_create_before_destroy_replacement() {
        let h = Harness::new(FakePlugin::new(LB).with_create_before_destroy());
        h.apply(&[lb("web", "round_robin")]).await;

        let plan = h.plan(&[lb("web", "least_connections")]).await;
        assert!(plan.changes[0].create_before_destroy);
        let report = h.apply(&[lb("web", "least_connections")]).await;
        assert!(report.success());
        assert_eq!(h.plugin.events(), vec!["create:web", "create:web", "delete:web"]);

        let state = h.state().await;
        let instance = state.get(&addr("web")).expect("web");
        assert!(instance.deposed.is_empty());
        assert_eq!(h.plugin.live_ids(), vec![instance.id.clone()]);
    }

    #[tokio::test]
    async fn test_failed_deposed_delete_recovered_next_run() {
        let h = Harness::new(FakePlugin::new(LB).with_create_before_destroy());
        h.apply(&[lb("web", "round_robin")]).await;
        let old = h.state().await.get(&addr("web")).expect("web").id.clone();
        h.plugin.fail_next(Op::Delete, ProviderError::api(409, "load balancer busy"));

        let report = h.apply(&[lb("web", "least_connections")]).await;
        assert_eq!(statuses(&report), vec![OutcomeStatus::Failed]);
        let state = h.state().await;
        let instance = state.get(&addr("web")).expect("web");
        assert_ne!(instance.id, old);
        assert_eq!(instance.deposed, vec![old.clone()]);

        let plan = h.plan(&[lb("web", "least_connections")]).await;
        assert!(plan.changes[0].deposed);
        assert_eq!(plan.changes[1].action, Action::NoOp);

        let report = h.apply(&[lb("web", "least_connections")]).await;
        assert!(report.success());
        assert!(h.state().await.get(&addr("web")).expect("web").deposed.is_empty());
        assert!(!h.plugin.live_ids().contains(&old));
    }

    #[tokio::test]
    async fn test_stale_plan_rejected() {
        let h = Harness::new(FakePlugin::new(LB));
        let mut state = h.state().await;
        let plan = Planner::new(&h.registry)
            .plan(&[lb("web", "round_robin")], &state, "h")
            .expect("plan");
        state.bump();

        let err = h.executor().apply(&plan, state).await.unwrap_err();
        assert!(matches!(err, TerraceError::State(StateError::StalePlan { .. })));
        assert_eq!(h.plugin.calls(Op::Create), 0);
    }

    #[tokio::test]
    async fn test_save_failure_halts_apply() {
        let mut h = Harness::with_store(FakePlugin::new(LB), Arc::new(MemoryStateStore::failing_after(0)));
        h.options.continue_on_error = true;

        let report = h.apply(&[lb("a", "round_robin"), lb("b", "round_robin")]).await;
        assert_eq!(statuses(&report), vec![OutcomeStatus::Failed, OutcomeStatus::Skipped]);
        assert_eq!(report.final_state.serial, 0);
        assert!(report.final_state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_apply_resumes_without_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(dir.path()));
        let token = CancellationToken::new();
        let h = Harness::with_store(FakePlugin::new(LB).cancel_after_creates(1, token.clone()), store);
        let declared = [lb("a", "round_robin"), lb("b", "round_robin")];

        // the process stops issuing work after the first step commits
        let executor = h.executor().with_cancellation(token);
        let report = h.apply_with(&executor, &declared).await;
        assert!(report.cancelled);
        assert_eq!(statuses(&report), vec![OutcomeStatus::Applied, OutcomeStatus::Cancelled]);

        let reloaded = h.state().await;
        assert!(reloaded.get(&addr("a")).is_some());
        assert!(reloaded.get(&addr("b")).is_none());

        let plan = h.plan(&declared).await;
        assert_eq!(plan.count(Action::NoOp), 1);
        assert_eq!(plan.count(Action::Create), 1);

        let report = h.apply(&declared).await;
        assert!(report.success());
        assert_eq!(h.plugin.calls(Op::Create), 2);
        assert_eq!(h.plugin.live_ids().len(), 2);
        assert_eq!(h.state().await.resources.len(), 2);
    }

    #[test]
    fn test_merge_ignores_live_values_of_undeclared_attributes() {
        let plugin = FakePlugin::new(LB);
        let desired = attrs(&[("name", AttributeValue::string("web"))]);
        let live = attrs(&[
            ("name", AttributeValue::string("web")),
            ("description", AttributeValue::string("stale")),
            ("ip", AttributeValue::string("10.0.0.1")),
        ]);

        let merged = merge_attributes(plugin.schema(), &AttributeMap::new(), &desired, live);
        assert!(!merged.contains_key("description"));
        assert_eq!(merged["ip"], AttributeValue::string("10.0.0.1"));
    }

    #[test]
    fn test_merge_drops_removed_declared_values() {
        let plugin = FakePlugin::new(LB);
        let schema = plugin.schema();
        let recorded = attrs(&[
            ("name", AttributeValue::string("web")),
            ("ip", AttributeValue::string("10.0.0.1")),
            ("droplet_ids", AttributeValue::set([AttributeValue::Int(1)])),
        ]);
        let desired = attrs(&[("name", AttributeValue::string("web"))]);
        let live = attrs(&[("status", AttributeValue::string("active")), ("extra", AttributeValue::Bool(true))]);

        let merged = merge_attributes(schema, &recorded, &desired, live);
        assert_eq!(merged["ip"], AttributeValue::string("10.0.0.1"));
        assert_eq!(merged["status"], AttributeValue::string("active"));
        assert!(merged.contains_key("droplet_ids"));
        assert!(!merged.contains_key("extra"));
    }
}
