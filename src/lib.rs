// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden
#![warn(unused_imports)]
#![warn(unused_variables)]

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::too_many_arguments)]
#![warn(clippy::cognitive_complexity)]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Terrace
//!
//! A declarative infrastructure reconciler. You describe the resources you
//! want in `terrace.yaml`; Terrace records what it manages in a durable
//! state document and converges live infrastructure to the declaration.
//!
//! ## Architecture
//!
//! Every run follows the same cycle:
//!
//! 1. **Refresh**: read each tracked resource from its provider and fold
//!    live values into state, dropping resources that no longer exist
//! 2. **Plan**: diff declared attributes against state and order one action
//!    per resource (create, update, replace, delete) by dependency
//! 3. **Apply**: run the plan concurrently, committing state after every
//!    completed step so an interrupted run resumes without duplicates
//!
//! Resource types plug in through [`provider::ResourcePlugin`]. The engine
//! itself knows nothing about any cloud; the built-in plugin manages
//! DigitalOcean load balancers.
//!
//! ## Modules
//!
//! - [`schema`]: Attribute values, set identity and resource schemas
//! - [`config`]: Configuration parsing, references and validation
//! - [`state`]: State document and storage backends (local, S3)
//! - [`provider`]: Plugin interface, registry and built-in plugins
//! - [`planner`]: Diff, dependency graph, plan and executor
//! - [`refresh`]: Drift detection
//! - [`reconciler`]: The engine façade
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! resources:
//!   - type: digitalocean_loadbalancer
//!     name: web
//!     attributes:
//!       name: web-lb
//!       algorithm: round_robin
//!       region: nyc1
//!       droplet_ids: [1001, 1002]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod address;
pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod refresh;
pub mod schema;
pub mod state;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use address::ResourceAddress;
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeclaredConfig, DeclaredResource};
pub use error::{ProviderError, Result, TerraceError};
pub use planner::{ApplyReport, ExecutorOptions, Plan, PlanExecutor, Planner};
pub use provider::{PluginRegistry, ResourcePlugin};
pub use reconciler::{ApplyOutcome, Reconciler};
pub use refresh::{DriftReport, Refresher};
pub use schema::{AttributeSchema, AttributeValue, ResourceSchema};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
