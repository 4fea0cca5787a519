//! Command-line interface.
//!
//! Argument definitions live in `commands`; rendering of plans, reports and
//! state in `output`. The binary wires them to the [`Reconciler`](crate::reconciler::Reconciler).

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
