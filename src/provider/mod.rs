//! Resource plugins and the registry that maps type names to them.

pub mod digitalocean;
mod plugin;
mod registry;

pub use plugin::{AttributeChanges, Capabilities, Created, ReadResult, ResourcePlugin};
pub use registry::PluginRegistry;
