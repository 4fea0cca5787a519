//! Declared configuration.
//!
//! This module handles everything between `terrace.yaml` and the planner:
//! - Parsing YAML with environment overrides
//! - Attribute expressions and `${type.name.attr}` references
//! - Validation against the plugin registry
//! - Configuration hashes for change detection

mod expr;
mod hash;
mod parser;
mod spec;
mod validator;

pub use expr::{DeclaredResource, Expr, ResourceRef};
pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, DIGITALOCEAN_TOKEN_VAR, find_config_file};
pub use spec::{
    ApplyConfig, DeclaredConfig, ProjectConfig, ResourceConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
