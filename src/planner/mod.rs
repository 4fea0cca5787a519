//! Diffing, planning and plan execution.
//!
//! This module compares declared resources with recorded state, orders the
//! resulting changes by dependency and applies them through the resource
//! plugins.

mod diff;
mod executor;
mod graph;
mod plan;
mod retry;

pub use diff::{AttributeDiff, Diff, DiffAction, SetDelta, diff, planned_attributes};
pub use executor::{ApplyReport, ChangeOutcome, ExecutorOptions, OutcomeStatus, PlanExecutor};
pub use graph::DependencyGraph;
pub use plan::{Action, Plan, PlannedChange, Planner};
pub use retry::{Attempted, RetryPolicy};
