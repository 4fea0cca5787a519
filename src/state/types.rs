//! Persisted state types.
//!
//! A [`StateSnapshot`] is the versioned document recording every managed
//! resource instance: its provider id, last-known attributes and the
//! dependencies it had when last applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::address::ResourceAddress;
use crate::error::{Result, StateError, TerraceError};
use crate::schema::AttributeMap;

/// Current version of the state document format.
pub const STATE_FORMAT_VERSION: u32 = 2;

/// Newest format version this build still reads. A document one version
/// ahead only adds fields, which are kept but otherwise ignored.
pub const MAX_READABLE_VERSION: u32 = STATE_FORMAT_VERSION + 1;

/// Number of history entries kept in state.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State document format version.
    pub version: u32,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// Identifies the state lineage across serials.
    #[serde(default)]
    pub lineage: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied configuration.
    #[serde(default)]
    pub config_hash: String,
    /// Tracked resource instances.
    #[serde(default)]
    pub resources: BTreeMap<ResourceAddress, ResourceInstance>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent operations.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Top-level fields this build does not know, carried through saves.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// The recorded state of one resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInstance {
    /// Resource type.
    pub resource_type: String,
    /// Logical name.
    pub name: String,
    /// Provider-assigned identifier.
    pub id: String,
    /// Provider the instance is bound to.
    #[serde(default)]
    pub provider: String,
    /// Schema version the attributes were written with.
    #[serde(default)]
    pub schema_version: u32,
    /// Last-known attributes.
    #[serde(default)]
    pub attributes: AttributeMap,
    /// Dependencies recorded at the last apply.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Provider ids of replaced objects whose delete has not committed yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance was last updated.
    pub updated_at: DateTime<Utc>,
}

/// One entry in the state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of operation.
    pub operation: HistoryOperation,
    /// Configuration hash at the time.
    #[serde(default)]
    pub config_hash: String,
    /// Addresses touched.
    pub resources: Vec<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error summary on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Operations recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// Plan applied.
    Apply,
    /// Everything destroyed.
    Destroy,
    /// Live resource adopted.
    Import,
    /// State refreshed from live infrastructure.
    Refresh,
    /// Instance removed from state without touching infrastructure.
    StateRemove,
}

impl StateSnapshot {
    /// Creates an empty, never-saved state. Its lineage is assigned by the first [`bump`](Self::bump).
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            serial: 0,
            lineage: String::new(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
            extensions: BTreeMap::new(),
        }
    }

    /// Parses a state document, upgrading older format versions.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] for malformed documents and
    /// [`StateError::VersionMismatch`] for documents more than one format
    /// version newer than this build.
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(content).map_err(|e| {
            TerraceError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;

        let found = raw
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                TerraceError::State(StateError::Corrupted {
                    message: String::from("state document has no numeric version"),
                })
            })?;
        if found > MAX_READABLE_VERSION {
            return Err(TerraceError::State(StateError::VersionMismatch {
                expected: MAX_READABLE_VERSION,
                found,
            }));
        }

        let mut state: Self = serde_json::from_value(raw).map_err(|e| {
            TerraceError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;
        state.upgrade();
        Ok(state)
    }

    /// Serializes the state document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            TerraceError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
        })
    }

    /// Brings an older document up to the current format.
    ///
    /// Version 1 documents carry no lineage; it is assigned on the next save.
    fn upgrade(&mut self) {
        if self.version < STATE_FORMAT_VERSION {
            self.version = STATE_FORMAT_VERSION;
        }
    }

    /// Looks up an instance.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceInstance> {
        self.resources.get(address)
    }

    /// Looks up an instance mutably.
    pub fn get_mut(&mut self, address: &ResourceAddress) -> Option<&mut ResourceInstance> {
        self.resources.get_mut(address)
    }

    /// Adds or replaces an instance.
    pub fn insert(&mut self, instance: ResourceInstance) {
        self.resources.insert(instance.address(), instance);
    }

    /// Removes an instance.
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<ResourceInstance> {
        self.resources.remove(address)
    }

    /// Tracked addresses in sorted order.
    pub fn addresses(&self) -> impl Iterator<Item = &ResourceAddress> {
        self.resources.keys()
    }

    /// Marks the snapshot as a new version, ready to save.
    pub fn bump(&mut self) {
        if self.lineage.is_empty() {
            self.lineage = Uuid::new_v4().to_string();
        }
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Appends a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }
}

impl ResourceInstance {
    /// Creates an instance record.
    #[must_use]
    pub fn new(address: &ResourceAddress, id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            resource_type: address.resource_type.clone(),
            name: address.name.clone(),
            id: id.into(),
            provider: provider.into(),
            schema_version: 0,
            attributes: AttributeMap::new(),
            dependencies: BTreeSet::new(),
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the attributes and schema version.
    #[must_use]
    pub fn with_attributes(mut self, schema_version: u32, attributes: AttributeMap) -> Self {
        self.schema_version = schema_version;
        self.attributes = attributes;
        self
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<ResourceAddress>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// The instance address.
    #[must_use]
    pub fn address(&self) -> ResourceAddress {
        ResourceAddress::new(&self.resource_type, &self.name)
    }

    /// Marks the record as modified.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: HistoryOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: HistoryOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Import => "import",
            Self::Refresh => "refresh",
            Self::StateRemove => "state rm",
        };
        write!(f, "{op}")
    }
}
