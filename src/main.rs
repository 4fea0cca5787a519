//! Terrace CLI entrypoint.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use terrace::address::ResourceAddress;
use terrace::cli::{Cli, Commands, OutputFormatter, StateCommands};
use terrace::config::{
    ConfigHasher, ConfigParser, ConfigValidator, DeclaredConfig, DeclaredResource, StateBackend,
    find_config_file,
};
use terrace::error::{Result, TerraceError};
use terrace::planner::{ExecutorOptions, Plan};
use terrace::provider::PluginRegistry;
use terrace::provider::digitalocean::{DigitalOceanClient, LoadBalancerPlugin};
use terrace::reconciler::Reconciler;
use terrace::state::{
    HistoryOperation, LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes logging on stderr so stdout stays clean for command output.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply {
            yes,
            continue_on_error,
            parallelism,
        } => {
            let project = Project::load(config).await?;
            let mut options = ExecutorOptions::from(&project.config.apply);
            options.continue_on_error |= continue_on_error;
            if let Some(parallelism) = parallelism {
                options.parallelism = parallelism.max(1);
            }
            cmd_apply(&project, options, yes, cancel, &formatter).await
        }
        Commands::Refresh => cmd_refresh(config, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Import { address, id } => cmd_import(config, &address, &id, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, cancel, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Cancels `token` on the first Ctrl-C. In-flight operations still finish and commit.
fn spawn_interrupt_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; waiting for in-flight operations to finish");
            token.cancel();
        }
    });
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let config = parse_config(&config_file)?;
    let registry = build_registry(false)?;
    let result = ConfigValidator::new(&registry).check(&config);

    emit(&formatter.format_validation(&result, show_warnings));

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the execution plan.
async fn cmd_plan(config_path: Option<&Path>, detailed: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    let project = Project::load(config_path).await?;
    let (reconciler, declared) = project.engine(ExecutorOptions::from(&project.config.apply))?;

    let plan = reconciler.plan(&declared, &project.config_hash()).await?;
    emit(&formatter.format_plan(&plan, detailed));

    Ok(ExitCode::SUCCESS)
}

/// Plan and apply.
async fn cmd_apply(
    project: &Project,
    options: ExecutorOptions,
    auto_approve: bool,
    cancel: CancellationToken,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (reconciler, declared) = project.engine(options)?;
    let reconciler = reconciler.with_cancellation(cancel);

    let plan = reconciler.plan(&declared, &project.config_hash()).await?;
    emit(&formatter.format_plan(&plan, false));

    if plan.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    apply(&reconciler, &plan, HistoryOperation::Apply, formatter).await
}

/// Refresh state from live infrastructure.
async fn cmd_refresh(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let project = Project::load(config_path).await?;
    let reconciler = project.reconciler(build_registry(true)?, ExecutorOptions::from(&project.config.apply));

    let result = reconciler.refresh().await?;
    emit(&formatter.format_refresh(&result));

    Ok(ExitCode::SUCCESS)
}

/// Report drift without changing state.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let project = Project::load(config_path).await?;
    let reconciler = project.reconciler(build_registry(true)?, ExecutorOptions::from(&project.config.apply));

    let report = reconciler.check_drift().await?;
    emit(&formatter.format_drift(&report));

    Ok(ExitCode::SUCCESS)
}

/// Adopt an existing resource.
async fn cmd_import(
    config_path: Option<&Path>,
    address: &ResourceAddress,
    id: &str,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let project = Project::load(config_path).await?;
    let reconciler = project.reconciler(build_registry(true)?, ExecutorOptions::from(&project.config.apply));

    let instance = reconciler.import(address, id).await?;
    emit(&formatter.format_instance(&instance));

    Ok(ExitCode::SUCCESS)
}

/// Destroy every tracked resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    cancel: CancellationToken,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let project = Project::load(config_path).await?;
    let reconciler = project
        .reconciler(build_registry(true)?, ExecutorOptions::from(&project.config.apply))
        .with_cancellation(cancel);

    let plan = reconciler.plan_destroy().await?;
    if plan.is_empty() {
        emit(&formatter.message("No resources to destroy."));
        return Ok(ExitCode::SUCCESS);
    }
    emit(&formatter.format_plan(&plan, false));

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    apply(&reconciler, &plan, HistoryOperation::Destroy, formatter).await
}

/// State management commands.
async fn cmd_state(config_path: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<ExitCode> {
    let project = Project::load(config_path).await?;

    match command {
        StateCommands::Show => match project.store.load().await? {
            Some(state) => emit(&formatter.format_state(&state)),
            None => emit(&formatter.message("No state found.")),
        },
        StateCommands::List => {
            let reconciler = project.reconciler(PluginRegistry::new(), ExecutorOptions::default());
            let state = reconciler.load_state().await?;
            emit(&formatter.format_resources(&state));
        }
        StateCommands::Rm { address } => {
            let reconciler = project.reconciler(PluginRegistry::new(), ExecutorOptions::default());
            let removed = reconciler.state_remove(&address).await?;
            emit(&formatter.message(&format!("Removed {address} ({}) from state.", removed.id)));
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = project.store.acquire_lock(&holder, "manual").await?;
            emit(&formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                project.store.force_unlock().await?;
                emit(&formatter.message("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                project.store.release_lock(&id).await?;
                emit(&formatter.message("State unlocked."));
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Applies a plan and prints the report. Failed or cancelled steps give a failing exit code.
async fn apply(
    reconciler: &Reconciler,
    plan: &Plan,
    operation: HistoryOperation,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let report = reconciler.apply_plan(plan, operation).await?;
    emit(&formatter.format_apply(&report));

    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Loaded configuration plus the state store it selects.
struct Project {
    config: DeclaredConfig,
    store: Arc<dyn StateStore>,
}

impl Project {
    /// Loads configuration and creates the appropriate state store.
    async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        let config = parse_config(&config_file)?;

        let store: Arc<dyn StateStore> = match config.state.backend {
            StateBackend::Local => {
                let base = config_file.parent().unwrap_or_else(|| Path::new("."));
                let path = config
                    .state
                    .path
                    .as_ref()
                    .map_or_else(|| base.join(STATE_DIR), |path| base.join(path));
                debug!("Using local state in {}", path.display());
                Arc::new(LocalStateStore::with_base_dir(path))
            }
            StateBackend::S3 => {
                let bucket = config
                    .state
                    .bucket
                    .as_deref()
                    .ok_or_else(|| TerraceError::internal("S3 bucket not configured"))?;
                let prefix = config.state.prefix.as_deref();
                let region = config.state.region.as_deref();
                Arc::new(S3StateStore::new(bucket, prefix, region).await)
            }
        };

        Ok(Self { config, store })
    }

    fn config_hash(&self) -> String {
        ConfigHasher::new().hash_config(&self.config)
    }

    fn reconciler(&self, registry: PluginRegistry, options: ExecutorOptions) -> Reconciler {
        Reconciler::new(registry, Arc::clone(&self.store), &self.config.project, options)
    }

    /// Builds a reconciler plus the validated declared resources.
    fn engine(&self, options: ExecutorOptions) -> Result<(Reconciler, Vec<DeclaredResource>)> {
        let registry = build_registry(true)?;
        let declared = ConfigValidator::new(&registry).validate(&self.config)?.resources;
        Ok((self.reconciler(registry, options), declared))
    }
}

/// Registers the built-in plugins. Without `require_token` a missing API
/// token is tolerated, for commands that only need schemas.
fn build_registry(require_token: bool) -> Result<PluginRegistry> {
    let token = match ConfigParser::digitalocean_token() {
        Ok(token) => token,
        Err(e) if require_token => return Err(e),
        Err(_) => String::new(),
    };

    let client = DigitalOceanClient::new(&token)?;
    PluginRegistry::new().with_plugin(Arc::new(LoadBalancerPlugin::new(client)))
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads `.env` next to the configuration, then the configuration itself.
fn parse_config(config_file: &Path) -> Result<DeclaredConfig> {
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_file.parent().unwrap_or_else(|| Path::new(".")));
    parser.load_dotenv()?;
    parser.load_with_env(config_file)
}

/// Asks for confirmation on stderr; true if the answer equals `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(output: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(output.as_bytes());
    let _ = stdout.flush();
}
