//! Attribute schema and value model.
//!
//! This module provides the typed vocabulary shared by plugins, the differ
//! and the state store:
//! - [`AttributeValue`]: tagged union of every attribute's semantic type
//! - [`AttributeSchema`] / [`ResourceSchema`]: per-attribute flags and types
//! - [`ContentIdentity`]: content-hash identity for set elements

mod attribute;
mod identity;
mod value;

pub use attribute::{AttributeSchema, AttributeType, ResourceSchema};
pub use identity::{ContentIdentity, ElementHash};
pub use value::{AttributeMap, AttributeValue, ValueSet};
