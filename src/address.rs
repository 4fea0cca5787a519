//! Resource addresses.
//!
//! Every resource instance is identified by its type and logical name,
//! written `type.name` (e.g. `digitalocean_loadbalancer.web`).

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Identity of a resource instance: `(type, logical name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Resource type, as registered in the plugin registry.
    pub resource_type: String,
    /// Logical name, unique within the type.
    pub name: String,
}

impl ResourceAddress {
    /// Creates an address from its parts.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl FromStr for ResourceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource_type, name) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid resource address {s:?}: expected type.name"))?;

        if resource_type.is_empty() || name.is_empty() || name.contains('.') {
            return Err(format!("invalid resource address {s:?}: expected type.name"));
        }

        Ok(Self::new(resource_type, name))
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}
