//! Declared configuration types.
//!
//! This module defines the structs that map to `terrace.yaml`: the desired
//! state of every managed resource plus the settings that control where
//! state lives and how apply behaves.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// The root of a declared configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeclaredConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Apply behaviour.
    #[serde(default)]
    pub apply: ApplyConfig,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Apply behaviour: concurrency, failure policy, retries and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ApplyConfig {
    /// Maximum number of plugin operations in flight.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 256))]
    pub parallelism: usize,
    /// Keep applying independent branches after a failure.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Attempts per operation, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    #[validate(range(min = 1))]
    pub initial_backoff_ms: u64,
    /// Upper bound on the retry delay.
    #[serde(default = "default_max_backoff_ms")]
    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,
    /// Deadline for a single plugin operation.
    #[serde(default = "default_operation_timeout_secs")]
    #[validate(range(min = 1))]
    pub operation_timeout_secs: u64,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type, resolved through the plugin registry.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique within the type.
    pub name: String,
    /// Explicit dependencies, as `type.name` addresses.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Attribute values. Strings of the form `${type.name.attr}` are references.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            continue_on_error: false,
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl DeclaredConfig {
    /// Creates a configuration with no resources.
    #[must_use]
    pub fn empty(project: &str, environment: &str) -> Self {
        Self {
            project: ProjectConfig {
                name: project.to_string(),
                environment: environment.to_string(),
            },
            state: StateConfig::default(),
            apply: ApplyConfig::default(),
            resources: Vec::new(),
        }
    }

    /// Returns the address strings of all declared resources.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|r| format!("{}.{}", r.resource_type, r.name))
            .collect()
    }
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_parallelism() -> usize {
    10
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_operation_timeout_secs() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_defaults() {
        let apply = ApplyConfig::default();
        assert_eq!(apply.parallelism, 10);
        assert_eq!(apply.max_attempts, 5);
        assert!(!apply.continue_on_error);
        assert!(apply.validate().is_ok());
    }

    #[test]
    fn test_apply_range_validation() {
        let apply = ApplyConfig {
            parallelism: 0,
            ..ApplyConfig::default()
        };
        let errors = apply.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("parallelism"));
    }

    #[test]
    fn test_addresses() {
        let mut config = DeclaredConfig::empty("p", "dev");
        config.resources.push(ResourceConfig {
            resource_type: String::from("digitalocean_loadbalancer"),
            name: String::from("web"),
            depends_on: vec![],
            attributes: serde_json::Map::new(),
        });
        assert_eq!(config.addresses(), vec!["digitalocean_loadbalancer.web"]);
    }
}
