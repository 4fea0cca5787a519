//! In-memory plugin and state store used by engine tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, Result, StateError, TerraceError};
use crate::provider::{AttributeChanges, Capabilities, Created, ReadResult, ResourcePlugin};
use crate::schema::{AttributeMap, AttributeSchema, AttributeType, AttributeValue, ResourceSchema};
use crate::state::{LockInfo, StateSnapshot, StateStore};

/// Plugin operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Create,
    Read,
    Update,
    Delete,
}

#[derive(Debug, Default)]
struct FakeCloud {
    objects: BTreeMap<String, AttributeMap>,
    next_id: u64,
    calls: BTreeMap<Op, usize>,
    failures: Vec<(Op, ProviderError)>,
    events: Vec<String>,
    updates: Vec<AttributeChanges>,
}

/// A load-balancer-shaped plugin backed by a map.
pub struct FakePlugin {
    type_name: String,
    schema: ResourceSchema,
    capabilities: Capabilities,
    not_found_as_error: bool,
    latency: Duration,
    cancel_after_creates: Option<(usize, CancellationToken)>,
    cloud: Mutex<FakeCloud>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakePlugin {
    pub fn new(type_name: &str) -> Self {
        let schema = ResourceSchema::new(1)
            .with_attribute("name", AttributeSchema::required(AttributeType::String).force_new())
            .with_attribute("algorithm", AttributeSchema::required(AttributeType::String).force_new())
            .with_attribute("region", AttributeSchema::required(AttributeType::String).force_new())
            .with_attribute("description", AttributeSchema::optional(AttributeType::String))
            .with_attribute("ip", AttributeSchema::computed(AttributeType::String))
            .with_attribute("status", AttributeSchema::computed(AttributeType::String).authoritative())
            .with_attribute(
                "droplet_ids",
                AttributeSchema::optional_computed(AttributeType::set_of(AttributeType::Int)).authoritative(),
            );

        Self {
            type_name: type_name.to_string(),
            schema,
            capabilities: Capabilities {
                create_before_destroy: false,
                import: true,
            },
            not_found_as_error: false,
            latency: Duration::ZERO,
            cancel_after_creates: None,
            cloud: Mutex::new(FakeCloud::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_create_before_destroy(mut self) -> Self {
        self.capabilities.create_before_destroy = true;
        self
    }

    /// Reports missing objects on read as `Err(NotFound)` instead of `Ok(NotFound)`.
    pub fn with_not_found_errors(mut self) -> Self {
        self.not_found_as_error = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Cancels `token` once `count` creates have succeeded.
    pub fn cancel_after_creates(mut self, count: usize, token: CancellationToken) -> Self {
        self.cancel_after_creates = Some((count, token));
        self
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: Op, error: ProviderError) {
        self.cloud().failures.push((op, error));
    }

    pub fn calls(&self, op: Op) -> usize {
        self.cloud().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.cloud().objects.keys().cloned().collect()
    }

    pub fn live(&self, id: &str) -> Option<AttributeMap> {
        self.cloud().objects.get(id).cloned()
    }

    /// Deletes an object behind the engine's back.
    pub fn remove_live(&self, id: &str) {
        self.cloud().objects.remove(id);
    }

    /// Changes a live attribute behind the engine's back.
    pub fn set_live(&self, id: &str, name: &str, value: AttributeValue) {
        if let Some(object) = self.cloud().objects.get_mut(id) {
            object.insert(name.to_string(), value);
        }
    }

    /// Creates an object directly, as if made outside the engine.
    pub fn seed(&self, attributes: AttributeMap) -> String {
        let mut cloud = self.cloud();
        cloud.next_id += 1;
        let id = format!("{}-{}", self.type_name, cloud.next_id);
        cloud.objects.insert(id.clone(), attributes);
        id
    }

    /// Operations in the order they completed, e.g. `create:web-lb`.
    pub fn events(&self) -> Vec<String> {
        self.cloud().events.clone()
    }

    /// Changed-attribute maps passed to update, in call order.
    pub fn updates(&self) -> Vec<AttributeChanges> {
        self.cloud().updates.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn cloud(&self) -> std::sync::MutexGuard<'_, FakeCloud> {
        self.cloud.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn enter(&self, op: Op) -> std::result::Result<(), ProviderError> {
        {
            let mut cloud = self.cloud();
            *cloud.calls.entry(op).or_default() += 1;
            if let Some(pos) = cloud.failures.iter().position(|(o, _)| *o == op) {
                return Err(cloud.failures.remove(pos).1);
            }
        }

        if !self.latency.is_zero() {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn label(attributes: &AttributeMap, id: &str) -> String {
        attributes
            .get("name")
            .and_then(AttributeValue::as_str)
            .map_or_else(|| id.to_string(), ToString::to_string)
    }
}

#[async_trait]
impl ResourcePlugin for FakePlugin {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn provider_name(&self) -> &str {
        "fake"
    }

    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn create(&self, desired: &AttributeMap) -> std::result::Result<Created, ProviderError> {
        self.enter(Op::Create).await?;
        self.schema
            .check_values(desired)
            .map_err(|problems| ProviderError::validation(problems.join("; ")))?;

        let (id, attributes, created) = {
            let mut cloud = self.cloud();
            cloud.next_id += 1;
            let id = format!("{}-{}", self.type_name, cloud.next_id);
            let mut attributes = desired.clone();
            attributes.insert(String::from("ip"), AttributeValue::string(format!("10.0.0.{}", cloud.next_id)));
            attributes.insert(String::from("status"), AttributeValue::string("active"));
            attributes
                .entry(String::from("droplet_ids"))
                .or_insert_with(|| AttributeValue::set([]));
            cloud.objects.insert(id.clone(), attributes.clone());
            let label = Self::label(&attributes, &id);
            cloud.events.push(format!("create:{label}"));
            let created = cloud.calls.get(&Op::Create).copied().unwrap_or(0);
            (id, attributes, created)
        };

        if let Some((count, token)) = &self.cancel_after_creates
            && created >= *count
        {
            token.cancel();
        }

        Ok(Created { id, attributes })
    }

    async fn read(&self, id: &str) -> std::result::Result<ReadResult, ProviderError> {
        self.enter(Op::Read).await?;
        match self.cloud().objects.get(id) {
            Some(attributes) => Ok(ReadResult::Found(attributes.clone())),
            None if self.not_found_as_error => Err(ProviderError::not_found(id)),
            None => Ok(ReadResult::NotFound),
        }
    }

    async fn update(&self, id: &str, changes: &AttributeChanges) -> std::result::Result<AttributeMap, ProviderError> {
        self.enter(Op::Update).await?;
        let mut cloud = self.cloud();
        cloud.updates.push(changes.clone());
        let object = cloud.objects.get_mut(id).ok_or_else(|| ProviderError::not_found(id))?;
        for (name, value) in &changes.set {
            object.insert(name.clone(), value.clone());
        }
        for name in &changes.removed {
            object.remove(name);
        }
        let attributes = object.clone();
        let label = Self::label(&attributes, id);
        cloud.events.push(format!("update:{label}"));
        Ok(attributes)
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), ProviderError> {
        self.enter(Op::Delete).await?;
        let mut cloud = self.cloud();
        let attributes = cloud.objects.remove(id).ok_or_else(|| ProviderError::not_found(id))?;
        let label = Self::label(&attributes, id);
        cloud.events.push(format!("delete:{label}"));
        Ok(())
    }

    async fn import(&self, id: &str) -> std::result::Result<AttributeMap, ProviderError> {
        match self.read(id).await? {
            ReadResult::Found(attributes) => Ok(attributes),
            ReadResult::NotFound => Err(ProviderError::not_found(id)),
        }
    }
}

/// State store kept in memory. Documents round-trip through JSON.
#[derive(Default)]
pub struct MemoryStateStore {
    document: Mutex<Option<String>>,
    lock: Mutex<Option<LockInfo>>,
    saves: AtomicUsize,
    fail_after_saves: Option<usize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every save after the first `count` fails.
    pub fn failing_after(count: usize) -> Self {
        Self {
            fail_after_saves: Some(count),
            ..Self::default()
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn document(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.document.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<LockInfo>> {
        self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Moves the held lock's expiry into the past, as if its holder stalled.
    pub fn backdate_lock(&self) {
        if let Some(lock) = self.lock_slot().as_mut() {
            lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        self.document().as_deref().map(StateSnapshot::from_json).transpose()
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        if self.fail_after_saves.is_some_and(|limit| self.saves() >= limit) {
            return Err(TerraceError::State(StateError::write("disk full")));
        }
        *self.document() = Some(state.to_json()?);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.document() = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.document().is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut slot = self.lock_slot();
        if let Some(existing) = slot.as_ref().filter(|l| !l.is_expired()) {
            return Err(TerraceError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }
        let info = LockInfo::new(holder, operation);
        *slot = Some(info.clone());
        Ok(info)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut slot = self.lock_slot();
        match slot.as_mut() {
            Some(held) if held.lock_id == lock.lock_id => {
                held.refresh();
                Ok(held.clone())
            }
            _ => Err(TerraceError::State(StateError::lock_lost(&lock.lock_id))),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut slot = self.lock_slot();
        if slot.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *slot = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock_slot() = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock_slot().clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Shorthand for building attribute maps in tests.
pub fn attrs(pairs: &[(&str, AttributeValue)]) -> AttributeMap {
    pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}
