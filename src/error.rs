//! Error types for the Terrace reconciliation engine.
//!
//! This module provides the error hierarchy for every phase of a
//! reconciliation cycle: configuration, state persistence, planning,
//! and the provider plugins invoked during refresh and apply.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Terrace engine.
#[derive(Debug, Error)]
pub enum TerraceError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// A plugin error, annotated with the resource it occurred on.
    #[error("{address}: {source}")]
    Resource {
        /// Address of the resource (`type.name`).
        address: String,
        /// Underlying plugin error.
        #[source]
        source: ProviderError,
    },

    /// Plugin error without a resource context.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource address: {address}")]
    DuplicateResource {
        /// The duplicated address.
        address: String,
    },

    /// No plugin is registered for a declared resource type.
    #[error("Unknown resource type: {resource_type}")]
    UnknownResourceType {
        /// The unregistered type name.
        resource_type: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing the state failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A lock this process took is gone or now belongs to someone else.
    #[error("State lock {lock_id} is no longer held")]
    LockLost {
        /// The lock that could not be renewed.
        lock_id: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version is not readable by this build.
    #[error("State version mismatch: expected at most {expected}, found {found}")]
    VersionMismatch {
        /// Highest supported format version.
        expected: u32,
        /// Found format version.
        found: u32,
    },

    /// The plan was computed against a different state serial.
    #[error("Plan is stale: computed against serial {planned}, state is at serial {current}")]
    StalePlan {
        /// Serial the plan was computed against.
        planned: u64,
        /// Current state serial.
        current: u64,
    },

    /// An instance address is not present in state.
    #[error("Resource not tracked in state: {address}")]
    NotTracked {
        /// The missing address.
        address: String,
    },

    /// An instance address is already present in state.
    #[error("Resource already tracked in state: {address}")]
    AlreadyTracked {
        /// The conflicting address.
        address: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", members.join(" -> "))]
    GraphCycle {
        /// Addresses participating in the cycle, in edge order.
        members: Vec<String>,
    },

    /// A resource depends on an address that is not declared.
    #[error("{address} depends on undeclared resource {dependency}")]
    UnknownDependency {
        /// The dependent resource.
        address: String,
        /// The missing dependency.
        dependency: String,
    },

    /// No plugin is registered for a resource type found in state or config.
    #[error("No plugin registered for resource type {resource_type}")]
    PluginNotFound {
        /// The unregistered type name.
        resource_type: String,
    },
}

/// Errors reported by resource plugins.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The request violates the resource schema. Never retried.
    #[error("Validation failed: {message}")]
    Validation {
        /// Description of the violation.
        message: String,
    },

    /// The resource does not exist on the provider side.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider id that was looked up.
        id: String,
    },

    /// A transient failure (network, 5xx, throttling). Retried with backoff.
    #[error("Transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// A single operation exceeded its deadline. Retried like a transient failure.
    #[error("Operation {operation} timed out after {timeout_secs}s")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Deadline that was exceeded.
        timeout_secs: u64,
    },

    /// The provider rejected the request.
    #[error("Provider API error: {status} - {message}")]
    Api {
        /// HTTP-like status code (0 when no response was received).
        status: u16,
        /// Error message from the provider.
        message: String,
    },

    /// The plugin does not support the requested capability.
    #[error("Operation not supported by plugin: {operation}")]
    Unsupported {
        /// Operation name.
        operation: String,
    },
}

/// Result type alias for Terrace operations.
pub type Result<T> = std::result::Result<T, TerraceError>;

impl TerraceError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wraps a plugin error with the address of the resource it concerns.
    #[must_use]
    pub fn resource(address: impl Into<String>, source: ProviderError) -> Self {
        Self::Resource {
            address: address.into(),
            source,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Resource { source, .. } | Self::Provider(source) => source.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write failure with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
    /// Creates a lost-lock error.
    #[must_use]
    pub fn lock_lost(lock_id: impl Into<String>) -> Self {
        Self::LockLost {
            lock_id: lock_id.into(),
        }
    }
}

impl ProviderError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates an API error.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Creates a not-found error for the given provider id.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Returns true if the failure may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Returns true if the provider reported the resource as absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
