//! Reconciler for converging infrastructure to the declared configuration.
//!
//! This module ties the engine together: it loads state, refreshes it
//! against live infrastructure, plans, and applies under the state lock,
//! recording each operation in the state history.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::address::ResourceAddress;
use crate::config::{DeclaredResource, ProjectConfig};
use crate::error::{ProviderError, Result, StateError, TerraceError};
use crate::planner::{ApplyReport, ExecutorOptions, Plan, PlanExecutor, Planner};
use crate::provider::PluginRegistry;
use crate::refresh::{DriftReport, RefreshResult, Refresher};
use crate::state::{
    HistoryEntry, HistoryOperation, LOCK_RENEW_SECS, LockInfo, ResourceInstance, StateSnapshot, StateStore,
    generate_holder_id,
};

/// The engine façade used by the CLI.
pub struct Reconciler {
    registry: PluginRegistry,
    store: Arc<dyn StateStore>,
    options: ExecutorOptions,
    project: ProjectConfig,
    holder: String,
    lock_renewal: Duration,
    cancel: CancellationToken,
}

/// A plan together with the result of applying it.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The plan that was applied.
    pub plan: Plan,
    /// Per-step outcomes and the committed state.
    pub report: ApplyReport,
}

impl Reconciler {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(
        registry: PluginRegistry,
        store: Arc<dyn StateStore>,
        project: &ProjectConfig,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            registry,
            store,
            options,
            project: project.clone(),
            holder: generate_holder_id(),
            lock_renewal: Duration::from_secs(LOCK_RENEW_SECS),
            cancel: CancellationToken::new(),
        }
    }

    /// Stops issuing new operations once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sets how often the state lock is renewed while an operation runs.
    #[must_use]
    pub const fn with_lock_renewal(mut self, every: Duration) -> Self {
        self.lock_renewal = every;
        self
    }

    /// Registered plugins.
    #[must_use]
    pub const fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.store.as_ref()
    }

    /// Loads state, or an empty state for this project if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored state cannot be read.
    pub async fn load_state(&self) -> Result<StateSnapshot> {
        Ok(self
            .store
            .load()
            .await?
            .unwrap_or_else(|| StateSnapshot::new(&self.project.name, &self.project.environment)))
    }

    fn refresher(&self) -> Refresher<'_> {
        Refresher::new(&self.registry, &self.options)
    }

    fn executor(&self) -> PlanExecutor {
        PlanExecutor::new(self.registry.clone(), Arc::clone(&self.store), self.options)
            .with_cancellation(self.cancel.clone())
    }

    /// Runs `work` while holding the state lock, renewing it in the
    /// background until `work` finishes.
    async fn locked<T>(&self, operation: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        let lock = self.store.acquire_lock(&self.holder, operation).await?;
        debug!(lock_id = %lock.lock_id, "Holding state lock for {operation}");

        let done = CancellationToken::new();
        let keeper = tokio::spawn(keep_lock_alive(
            Arc::clone(&self.store),
            lock.clone(),
            self.lock_renewal,
            done.clone(),
        ));

        let result = work.await;

        done.cancel();
        if let Err(e) = keeper.await {
            warn!("Lock renewal task failed: {e}");
        }
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    /// Compares state with live infrastructure without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.project.name, self.project.environment
        );
        let state = self.load_state().await?;
        Ok(self.refresher().refresh(state).await?.report)
    }

    /// Refreshes state from live infrastructure and saves it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere, a read fails, or the
    /// state cannot be saved.
    pub async fn refresh(&self) -> Result<RefreshResult> {
        self.locked("refresh", async {
            let state = self.load_state().await?;
            let mut result = self.refresher().refresh(state).await?;
            if result.changed_state() {
                let touched = result
                    .report
                    .vanished
                    .iter()
                    .chain(result.report.drifted.iter().map(|d| &d.address))
                    .map(ToString::to_string)
                    .collect();
                let hash = result.state.config_hash.clone();
                result
                    .state
                    .add_history(HistoryEntry::new(HistoryOperation::Refresh, &hash, touched));
                result.state.bump();
                self.store.save(&result.state).await?;
            }
            Ok(result)
        })
        .await
    }

    /// Plans the changes that converge live infrastructure to `declared`.
    ///
    /// State is refreshed in memory first; nothing is saved.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or refreshed, or planning
    /// fails (cycles, unknown references, unregistered types).
    pub async fn plan(&self, declared: &[DeclaredResource], config_hash: &str) -> Result<Plan> {
        let state = self.load_state().await?;
        let refreshed = self.refresher().refresh(state).await?;
        let plan = Planner::new(&self.registry).plan(declared, &refreshed.state, config_hash)?;
        info!("Plan: {}", plan.summary());
        Ok(plan)
    }

    /// Plans deleting every tracked resource.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or refreshed, or a
    /// tracked type has no plugin.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let state = self.load_state().await?;
        let refreshed = self.refresher().refresh(state).await?;
        Planner::new(&self.registry).plan_destroy(&refreshed.state)
    }

    /// Plans and applies `declared` in one step.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::plan`] and [`Reconciler::apply_plan`].
    pub async fn apply(&self, declared: &[DeclaredResource], config_hash: &str) -> Result<ApplyOutcome> {
        let plan = self.plan(declared, config_hash).await?;
        let report = self.apply_plan(&plan, HistoryOperation::Apply).await?;
        Ok(ApplyOutcome { plan, report })
    }

    /// Plans and applies the deletion of everything tracked.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::plan_destroy`] and [`Reconciler::apply_plan`].
    pub async fn destroy(&self) -> Result<ApplyOutcome> {
        let plan = self.plan_destroy().await?;
        let report = self.apply_plan(&plan, HistoryOperation::Destroy).await?;
        Ok(ApplyOutcome { plan, report })
    }

    /// Applies a previously computed plan under the state lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere, the plan is stale,
    /// or the final state cannot be saved. Step failures are reported in
    /// the returned report.
    pub async fn apply_plan(&self, plan: &Plan, operation: HistoryOperation) -> Result<ApplyReport> {
        let name = operation.to_string();
        self.locked(&name, async {
            let state = self.load_state().await?;
            let refreshed = self.refresher().refresh(state).await?;
            let mut report = self.executor().apply(plan, refreshed.state).await?;

            let touched: Vec<String> = plan.actionable().map(|c| c.address.to_string()).collect();
            let mut state = report.final_state.clone();
            let entry = if report.success() {
                state.config_hash = match operation {
                    HistoryOperation::Destroy => String::new(),
                    _ => plan.config_hash.clone(),
                };
                HistoryEntry::new(operation, &plan.config_hash, touched)
            } else {
                let errors: Vec<String> = report.failures().filter_map(|o| o.error.clone()).collect();
                let summary = if errors.is_empty() {
                    String::from("apply was interrupted")
                } else {
                    errors.join("; ")
                };
                HistoryEntry::failed(operation, &plan.config_hash, touched, &summary)
            };
            state.add_history(entry);
            state.bump();
            self.store.save(&state).await?;
            report.final_state = state;

            info!("{report}");
            Ok(report)
        })
        .await
    }

    /// Adopts a live resource that is not yet tracked.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin cannot import, the address is already
    /// tracked, or the resource cannot be read.
    pub async fn import(&self, address: &ResourceAddress, id: &str) -> Result<ResourceInstance> {
        self.locked("import", async {
            let plugin = self.registry.require(&address.resource_type)?;
            if !plugin.capabilities().import {
                return Err(TerraceError::resource(
                    address.to_string(),
                    ProviderError::Unsupported {
                        operation: String::from("import"),
                    },
                ));
            }

            let mut state = self.load_state().await?;
            if state.get(address).is_some() {
                return Err(TerraceError::State(StateError::AlreadyTracked {
                    address: address.to_string(),
                }));
            }

            let name = format!("import {address}");
            let outcome = self
                .options
                .retry
                .run(&name, self.options.operation_timeout, &self.cancel, || plugin.import(id))
                .await;
            let attributes = outcome
                .result
                .map_err(|e| TerraceError::resource(address.to_string(), e))?;

            let schema = plugin.schema();
            let attributes = attributes
                .into_iter()
                .filter(|(name, _)| schema.attribute(name).is_some())
                .collect();
            let instance = ResourceInstance::new(address, id, plugin.provider_name())
                .with_attributes(schema.version, attributes);

            state.insert(instance.clone());
            let hash = state.config_hash.clone();
            state.add_history(HistoryEntry::new(
                HistoryOperation::Import,
                &hash,
                vec![address.to_string()],
            ));
            state.bump();
            self.store.save(&state).await?;

            info!(id, "Imported {address}");
            Ok(instance)
        })
        .await
    }

    /// Stops tracking an instance without touching infrastructure.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not tracked or state cannot be saved.
    pub async fn state_remove(&self, address: &ResourceAddress) -> Result<ResourceInstance> {
        self.locked("state rm", async {
            let mut state = self.load_state().await?;
            let removed = state.remove(address).ok_or_else(|| {
                TerraceError::State(StateError::NotTracked {
                    address: address.to_string(),
                })
            })?;
            let hash = state.config_hash.clone();
            state.add_history(HistoryEntry::new(
                HistoryOperation::StateRemove,
                &hash,
                vec![address.to_string()],
            ));
            state.bump();
            self.store.save(&state).await?;
            info!("Removed {address} from state");
            Ok(removed)
        })
        .await
    }
}

/// Renews `lock` every `every` until `done` is cancelled.
async fn keep_lock_alive(store: Arc<dyn StateStore>, mut lock: LockInfo, every: Duration, done: CancellationToken) {
    let mut ticks = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the lock is fresh then
    ticks.tick().await;

    loop {
        tokio::select! {
            biased;
            () = done.cancelled() => break,
            _ = ticks.tick() => match store.renew_lock(&lock).await {
                Ok(renewed) => {
                    trace!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
                    lock = renewed;
                }
                Err(e) => warn!("Failed to renew state lock {}: {e}", lock.lock_id),
            },
        }
    }
}
