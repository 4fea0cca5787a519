//! Refresh and drift detection.
//!
//! Refresh reads every tracked instance through its plugin. Instances the
//! provider no longer knows are dropped from state. For the rest, computed
//! and authoritative attributes take the live value while declared values
//! are kept for the next diff. Every difference between recorded and live
//! values is reported as drift, whether or not refresh overwrote it.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::ResourceAddress;
use crate::error::{ProviderError, Result, TerraceError};
use crate::planner::{ExecutorOptions, RetryPolicy};
use crate::provider::{PluginRegistry, ReadResult, ResourcePlugin};
use crate::schema::{AttributeMap, AttributeValue, ResourceSchema};
use crate::state::{ResourceInstance, StateSnapshot};

/// One attribute whose live value differs from the recorded one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeDrift {
    /// Attribute name.
    pub attribute: String,
    /// Recorded value.
    pub recorded: Option<AttributeValue>,
    /// Live value.
    pub live: Option<AttributeValue>,
    /// Refresh replaced the recorded value with the live one.
    pub overwritten: bool,
}

/// Drift found on one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDrift {
    /// Instance address.
    pub address: ResourceAddress,
    /// Provider id.
    pub id: String,
    /// Differing attributes.
    pub attributes: Vec<AttributeDrift>,
}

/// Differences between state and live infrastructure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Instances whose attributes drifted.
    pub drifted: Vec<InstanceDrift>,
    /// Instances that no longer exist.
    pub vanished: Vec<ResourceAddress>,
    /// Number of instances read.
    pub checked: usize,
}

impl DriftReport {
    /// True if anything drifted or vanished.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.vanished.is_empty()
    }

    /// True if state matches live infrastructure.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift() {
            return write!(f, "No drift detected across {} resource(s)", self.checked);
        }
        writeln!(f, "Drift detected:")?;
        for instance in &self.drifted {
            writeln!(f, "  ~ {} ({})", instance.address, instance.id)?;
            for attr in &instance.attributes {
                let show =
                    |v: &Option<AttributeValue>| v.as_ref().map_or_else(|| String::from("null"), ToString::to_string);
                writeln!(f, "      {}: {} -> {}", attr.attribute, show(&attr.recorded), show(&attr.live))?;
            }
        }
        for address in &self.vanished {
            writeln!(f, "  - {address} (no longer exists)")?;
        }
        Ok(())
    }
}

/// Refreshed state plus what changed.
#[derive(Debug, Clone)]
pub struct RefreshResult {
    /// State with live values applied.
    pub state: StateSnapshot,
    /// Drift found while reading.
    pub report: DriftReport,
}

impl RefreshResult {
    /// True if refresh changed the state.
    #[must_use]
    pub fn changed_state(&self) -> bool {
        !self.report.vanished.is_empty()
            || self
                .report
                .drifted
                .iter()
                .any(|d| d.attributes.iter().any(|a| a.overwritten))
    }
}

/// Reads live infrastructure for every tracked instance.
pub struct Refresher<'a> {
    registry: &'a PluginRegistry,
    parallelism: usize,
    retry: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<'a> Refresher<'a> {
    /// Creates a refresher using the executor's concurrency and retry settings.
    #[must_use]
    pub fn new(registry: &'a PluginRegistry, options: &ExecutorOptions) -> Self {
        Self {
            registry,
            parallelism: options.parallelism.max(1),
            retry: options.retry,
            timeout: options.operation_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Refreshes `state` without saving it.
    ///
    /// # Errors
    ///
    /// Fails if a tracked type has no plugin or a read fails for a reason
    /// other than the resource being gone. State is left untouched then.
    pub async fn refresh(&self, mut state: StateSnapshot) -> Result<RefreshResult> {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut reads: JoinSet<(ResourceAddress, std::result::Result<ReadResult, ProviderError>)> = JoinSet::new();

        for (address, instance) in &state.resources {
            let plugin = self.registry.require(&address.resource_type)?;
            let semaphore = Arc::clone(&semaphore);
            let address = address.clone();
            let id = instance.id.clone();
            let retry = self.retry;
            let timeout = self.timeout;
            let cancel = self.cancel.clone();
            reads.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let name = format!("read {address}");
                let outcome = retry
                    .run(&name, timeout, &cancel, || plugin.read(&id))
                    .await;
                (address, outcome.result)
            });
        }

        let mut report = DriftReport {
            checked: state.resources.len(),
            ..DriftReport::default()
        };
        let mut live: Vec<(ResourceAddress, AttributeMap)> = Vec::new();
        while let Some(joined) = reads.join_next().await {
            let (address, result) = joined.map_err(|e| TerraceError::internal(format!("refresh task failed: {e}")))?;
            match result {
                Ok(ReadResult::Found(attributes)) => live.push((address, attributes)),
                Ok(ReadResult::NotFound) => report.vanished.push(address),
                Err(e) if e.is_not_found() => report.vanished.push(address),
                Err(e) => return Err(TerraceError::resource(address.to_string(), e)),
            }
        }

        report.vanished.sort();
        for address in &report.vanished {
            warn!("{address} no longer exists; dropping it from state");
            state.remove(address);
        }

        live.sort_by(|a, b| a.0.cmp(&b.0));
        for (address, attributes) in live {
            let plugin = self.registry.require(&address.resource_type)?;
            let Some(instance) = state.get_mut(&address) else {
                continue;
            };
            let drift = reconcile_instance(plugin.as_ref(), instance, attributes);
            if !drift.is_empty() {
                debug!("{address}: {} attribute(s) drifted", drift.len());
                report.drifted.push(InstanceDrift {
                    address: address.clone(),
                    id: instance.id.clone(),
                    attributes: drift,
                });
            }
        }

        info!(
            "Refreshed {} resource(s): {} drifted, {} vanished",
            report.checked,
            report.drifted.len(),
            report.vanished.len()
        );
        Ok(RefreshResult { state, report })
    }
}

/// Applies live attributes to `instance` and returns the differences.
fn reconcile_instance(
    plugin: &dyn ResourcePlugin,
    instance: &mut ResourceInstance,
    live: AttributeMap,
) -> Vec<AttributeDrift> {
    let schema: &ResourceSchema = plugin.schema();
    let names: BTreeSet<&String> = instance
        .attributes
        .keys()
        .chain(live.keys())
        .filter(|name| schema.attribute(name).is_some())
        .collect();

    let mut drift = Vec::new();
    let mut updates = AttributeMap::new();
    for name in names {
        let recorded = instance.attributes.get(name);
        let current = live.get(name);
        if recorded == current {
            continue;
        }
        let overwritten = current.is_some()
            && schema
                .attribute(name)
                .is_some_and(|attr| attr.computed || attr.authoritative);
        if overwritten && let Some(value) = current {
            updates.insert(name.clone(), value.clone());
        }
        drift.push(AttributeDrift {
            attribute: name.clone(),
            recorded: recorded.cloned(),
            live: current.cloned(),
            overwritten,
        });
    }

    if !updates.is_empty() {
        instance.attributes.extend(updates);
        instance.schema_version = schema.version;
        instance.touch();
    }
    drift
}
