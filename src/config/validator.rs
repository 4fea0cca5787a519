//! Declared configuration validation.
//!
//! Validation checks the configuration against the plugin registry and
//! produces the typed [`DeclaredResource`] list the planner consumes:
//! every resource type must be registered, every attribute must match its
//! schema, and every reference or `depends_on` entry must name a declared
//! resource.

use crate::address::ResourceAddress;
use crate::error::{ConfigError, Result, TerraceError};
use crate::provider::PluginRegistry;
use crate::schema::{AttributeType, ResourceSchema};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use validator::Validate;

use super::expr::{DeclaredResource, Expr, ResourceRef};
use super::spec::{ApplyConfig, DeclaredConfig, ProjectConfig, ResourceConfig, StateBackend, StateConfig};

/// Validator for declared configurations.
#[derive(Debug)]
pub struct ConfigValidator<'a> {
    registry: &'a PluginRegistry,
}

/// Outcome of validation: the typed resources plus every problem found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Resources that passed per-resource checks, in declaration order.
    pub resources: Vec<DeclaredResource>,
    /// Validation errors.
    pub errors: Vec<ValidationError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Path of the offending field.
    pub field: String,
    /// Error message.
    pub message: String,
}

impl ValidationResult {
    /// Returns true if no errors were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl<'a> ConfigValidator<'a> {
    /// Creates a validator that resolves resource types through `registry`.
    #[must_use]
    pub const fn new(registry: &'a PluginRegistry) -> Self {
        Self { registry }
    }

    /// Validates a configuration, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first problem found.
    pub fn validate(&self, config: &DeclaredConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        let Some(first) = result.errors.first() else {
            debug!(resources = result.resources.len(), "Configuration validation passed");
            return Ok(result);
        };

        let message = if result.errors.len() > 1 {
            format!("{} (and {} more)", first.message, result.errors.len() - 1)
        } else {
            first.message.clone()
        };
        Err(TerraceError::Config(ConfigError::validation(message, first.field.clone())))
    }

    /// Validates a configuration and collects every problem.
    #[must_use]
    pub fn check(&self, config: &DeclaredConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_apply(&config.apply, &mut result);
        self.validate_resources(&config.resources, &mut result);
        self.validate_references(&mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if state.backend == StateBackend::S3 && state.bucket.as_deref().is_none_or(str::is_empty) {
            result.error("state.bucket", "S3 bucket name is required when using S3 backend");
        }
    }

    fn validate_apply(apply: &ApplyConfig, result: &mut ValidationResult) {
        if let Err(errors) = apply.validate() {
            for (field, problems) in errors.field_errors() {
                for problem in problems {
                    let detail = match (problem.params.get("min"), problem.params.get("max")) {
                        (Some(min), Some(max)) => format!("must be between {min} and {max}"),
                        (Some(min), None) => format!("must be at least {min}"),
                        _ => problem.code.to_string(),
                    };
                    result.error(format!("apply.{field}"), format!("apply.{field} {detail}"));
                }
            }
        }

        if apply.max_backoff_ms < apply.initial_backoff_ms {
            result.error(
                "apply.max_backoff_ms",
                "apply.max_backoff_ms must not be smaller than apply.initial_backoff_ms",
            );
        }
    }

    fn validate_resources(&self, resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources declared in configuration"));
            return;
        }

        let mut seen = BTreeSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let address = ResourceAddress::new(&resource.resource_type, &resource.name);

            if !is_valid_identifier(&resource.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must start with a letter and contain only letters, digits, '_' or '-'.",
                        resource.name
                    ),
                );
                continue;
            }

            if !seen.insert(address.clone()) {
                result.error(format!("{prefix}.name"), format!("Duplicate resource address: {address}"));
                continue;
            }

            let Some(plugin) = self.registry.get(&resource.resource_type) else {
                result.error(
                    format!("{prefix}.type"),
                    format!("Unknown resource type: {}", resource.resource_type),
                );
                continue;
            };

            if let Some(declared) = Self::compile_resource(&prefix, address, resource, plugin.schema(), result) {
                result.resources.push(declared);
            }
        }
    }

    fn compile_resource(
        prefix: &str,
        address: ResourceAddress,
        resource: &ResourceConfig,
        schema: &ResourceSchema,
        result: &mut ValidationResult,
    ) -> Option<DeclaredResource> {
        let errors_before = result.errors.len();
        let mut attributes = BTreeMap::new();

        for (name, raw) in &resource.attributes {
            let field = format!("{prefix}.attributes.{name}");
            let Some(attr) = schema.attribute(name) else {
                result.error(field, format!("{address}: unknown attribute {name:?}"));
                continue;
            };
            if attr.is_computed_only() {
                result.error(field, format!("{address}: attribute {name:?} is computed and cannot be set"));
                continue;
            }
            match Expr::from_json(&attr.kind, raw) {
                Ok(expr) => {
                    attributes.insert(name.clone(), expr);
                }
                Err(e) => result.error(field, format!("{address}: attribute {name:?}: {e}")),
            }
        }

        for (name, attr) in &schema.attributes {
            if attr.required && !resource.attributes.contains_key(name) {
                result.error(
                    format!("{prefix}.attributes"),
                    format!("{address}: missing required attribute {name:?}"),
                );
            }
        }

        let mut depends_on = BTreeSet::new();
        for (j, raw) in resource.depends_on.iter().enumerate() {
            match raw.parse::<ResourceAddress>() {
                Ok(dep) => {
                    depends_on.insert(dep);
                }
                Err(e) => result.error(format!("{prefix}.depends_on[{j}]"), e),
            }
        }

        (result.errors.len() == errors_before).then_some(DeclaredResource {
            address,
            attributes,
            depends_on,
        })
    }

    /// Checks that dependencies and references target declared resources
    /// and that referenced attributes exist with a matching type.
    fn validate_references(&self, result: &mut ValidationResult) {
        let declared: BTreeSet<ResourceAddress> =
            result.resources.iter().map(|r| r.address.clone()).collect();
        let mut problems = Vec::new();

        for resource in &result.resources {
            for dep in &resource.depends_on {
                if !declared.contains(dep) {
                    problems.push(ValidationError {
                        field: format!("{}.depends_on", resource.address),
                        message: format!("{} depends on undeclared resource {dep}", resource.address),
                    });
                }
            }

            let Some(schema) = self
                .registry
                .get(&resource.address.resource_type)
                .map(|p| p.schema().clone())
            else {
                continue;
            };

            for (name, expr) in &resource.attributes {
                let Some(attr) = schema.attribute(name) else {
                    continue;
                };
                self.check_reference_types(
                    &resource.address,
                    name,
                    expr,
                    &attr.kind,
                    &declared,
                    &mut problems,
                );
            }
        }

        result.errors.extend(problems);
    }

    fn check_reference_types(
        &self,
        owner: &ResourceAddress,
        field: &str,
        expr: &Expr,
        expected: &AttributeType,
        declared: &BTreeSet<ResourceAddress>,
        problems: &mut Vec<ValidationError>,
    ) {
        match (expr, expected) {
            (Expr::Literal(_), _) => {}
            (Expr::Reference(reference), _) => {
                if let Err(message) = self.referenced_type(reference, declared).and_then(|found| {
                    if &found == expected {
                        Ok(())
                    } else {
                        Err(format!("{reference} is {found}, expected {expected}"))
                    }
                }) {
                    problems.push(ValidationError {
                        field: format!("{owner}.{field}"),
                        message: format!("{owner}: attribute {field:?}: {message}"),
                    });
                }
            }
            (Expr::List(items) | Expr::Set(items), AttributeType::List(elem) | AttributeType::Set(elem)) => {
                for item in items {
                    self.check_reference_types(owner, field, item, elem, declared, problems);
                }
            }
            (Expr::Block(fields), AttributeType::Block(schemas)) => {
                for (key, item) in fields {
                    if let Some(schema) = schemas.get(key) {
                        let path = format!("{field}.{key}");
                        self.check_reference_types(owner, &path, item, &schema.kind, declared, problems);
                    }
                }
            }
            _ => {}
        }
    }

    fn referenced_type(
        &self,
        reference: &ResourceRef,
        declared: &BTreeSet<ResourceAddress>,
    ) -> std::result::Result<AttributeType, String> {
        if !declared.contains(&reference.address) {
            return Err(format!("references undeclared resource {}", reference.address));
        }
        if reference.attribute == "id" {
            return Ok(AttributeType::String);
        }
        self.registry
            .get(&reference.address.resource_type)
            .and_then(|plugin| plugin.schema().attribute(&reference.attribute).map(|a| a.kind.clone()))
            .ok_or_else(|| format!("{} has no attribute {:?}", reference.address, reference.attribute))
    }
}

/// Checks if a project name is valid: lowercase alphanumeric with hyphens,
/// starting with a letter and not ending with a hyphen.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
}

/// Checks if a resource name is a valid identifier.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
