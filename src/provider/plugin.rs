//! Resource plugin capability interface.
//!
//! The engine knows nothing about any particular kind of infrastructure.
//! Each resource type plugs in through [`ResourcePlugin`]: a schema plus
//! create / read / update / delete callbacks and an optional import.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::schema::{AttributeMap, ResourceSchema};

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Provider-assigned identifier.
    pub id: String,
    /// Attributes reported by the provider.
    pub attributes: AttributeMap,
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// The resource exists; its current attributes.
    Found(AttributeMap),
    /// The resource no longer exists.
    NotFound,
}

/// Attribute changes handed to [`ResourcePlugin::update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeChanges {
    /// Attributes to set, with their new values.
    pub set: AttributeMap,
    /// Attributes no longer declared. The plugin clears them on the live
    /// resource.
    pub removed: BTreeSet<String>,
}

impl AttributeChanges {
    /// Returns true when nothing is set or removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.removed.is_empty()
    }

    /// Names of every attribute touched, set or removed.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.set.keys().chain(self.removed.iter()).map(String::as_str)
    }
}

/// Optional behaviours a plugin advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Replacement creates the new object before destroying the old one.
    pub create_before_destroy: bool,
    /// The plugin implements [`ResourcePlugin::import`].
    pub import: bool,
}

/// A resource type's schema and CRUD operations.
#[async_trait]
pub trait ResourcePlugin: Send + Sync {
    /// Resource type name, e.g. `digitalocean_loadbalancer`.
    fn type_name(&self) -> &str;

    /// Name of the provider this type belongs to, recorded in state.
    fn provider_name(&self) -> &str;

    /// Attribute schema.
    fn schema(&self) -> &ResourceSchema;

    /// Optional capabilities.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Creates the resource from fully-resolved desired attributes.
    async fn create(&self, desired: &AttributeMap) -> Result<Created, ProviderError>;

    /// Reads the live resource.
    ///
    /// A missing resource is reported as [`ReadResult::NotFound`] or as
    /// [`ProviderError::NotFound`]; the engine treats both identically.
    async fn read(&self, id: &str) -> Result<ReadResult, ProviderError>;

    /// Applies in-place changes to an existing resource.
    ///
    /// `changes.set` carries only attributes whose value differs from state.
    /// `changes.removed` names optional attributes that were dropped from the
    /// declaration; the plugin resets them to the provider default. Returns
    /// the attributes the provider reports afterwards.
    async fn update(&self, id: &str, changes: &AttributeChanges) -> Result<AttributeMap, ProviderError>;

    /// Deletes the resource.
    async fn delete(&self, id: &str) -> Result<(), ProviderError>;

    /// Reads a pre-existing resource that is not yet tracked.
    async fn import(&self, id: &str) -> Result<AttributeMap, ProviderError> {
        let _ = id;
        Err(ProviderError::Unsupported {
            operation: String::from("import"),
        })
    }
}
