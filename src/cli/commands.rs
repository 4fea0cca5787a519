//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::address::ResourceAddress;

/// Terrace - declarative infrastructure reconciler.
#[derive(Parser, Debug)]
#[command(name = "terrace")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "TERRACE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration against the resource schemas.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Refresh state in memory and show the changes apply would make.
    Plan {
        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply changes.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Keep applying independent resources after a failure.
        #[arg(long)]
        continue_on_error: bool,

        /// Maximum concurrent provider operations.
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Update state from live infrastructure.
    Refresh,

    /// Report differences between state and live infrastructure.
    Drift,

    /// Adopt an existing resource into state.
    Import {
        /// Resource address, e.g. `digitalocean_loadbalancer.web`.
        address: ResourceAddress,

        /// Provider identifier of the existing resource.
        id: String,
    },

    /// Destroy every tracked resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect and manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the state summary and recent history.
    Show,

    /// List tracked resources.
    List,

    /// Stop tracking a resource without touching infrastructure.
    Rm {
        /// Resource address.
        address: ResourceAddress,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "terrace",
            "apply",
            "--yes",
            "--continue-on-error",
            "--parallelism",
            "4",
            "--output",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Apply {
                yes,
                continue_on_error,
                parallelism,
            } => {
                assert!(yes);
                assert!(continue_on_error);
                assert_eq!(parallelism, Some(4));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_import_parses_address() {
        let cli = Cli::try_parse_from(["terrace", "import", "digitalocean_loadbalancer.web", "lb-1"]).unwrap();
        match cli.command {
            Commands::Import { address, id } => {
                assert_eq!(address, ResourceAddress::new("digitalocean_loadbalancer", "web"));
                assert_eq!(id, "lb-1");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!(Cli::try_parse_from(["terrace", "state", "rm", "no-dot"]).is_err());
    }
}
