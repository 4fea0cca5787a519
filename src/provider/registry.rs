//! Plugin registry.
//!
//! An explicit registry object is handed to the engine at construction;
//! there is no process-wide plugin table.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ConfigError, PlanError, Result, TerraceError};

use super::plugin::ResourcePlugin;

/// Maps resource type names to their plugins.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn ResourcePlugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its type name.
    ///
    /// # Errors
    ///
    /// Returns an error if the type is already registered or its schema
    /// violates the attribute flag invariant.
    pub fn register(&mut self, plugin: Arc<dyn ResourcePlugin>) -> Result<()> {
        let type_name = plugin.type_name().to_string();

        if self.plugins.contains_key(&type_name) {
            return Err(TerraceError::Config(ConfigError::validation(
                format!("resource type {type_name} registered twice"),
                type_name,
            )));
        }

        plugin.schema().check().map_err(|message| {
            TerraceError::Config(ConfigError::validation(
                format!("invalid schema: {message}"),
                type_name.clone(),
            ))
        })?;

        debug!("Registered plugin for resource type {type_name}");
        self.plugins.insert(type_name, plugin);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn with_plugin(mut self, plugin: Arc<dyn ResourcePlugin>) -> Result<Self> {
        self.register(plugin)?;
        Ok(self)
    }

    /// Looks up a plugin.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourcePlugin>> {
        self.plugins.get(resource_type).cloned()
    }

    /// Looks up a plugin, failing if the type is unregistered.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::PluginNotFound`] if no plugin is registered.
    pub fn require(&self, resource_type: &str) -> Result<Arc<dyn ResourcePlugin>> {
        self.get(resource_type).ok_or_else(|| {
            TerraceError::Plan(PlanError::PluginNotFound {
                resource_type: resource_type.to_string(),
            })
        })
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("types", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}
