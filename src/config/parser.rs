//! Loading declared configuration from YAML and the environment.

use crate::error::{ConfigError, Result, TerraceError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeclaredConfig;

/// Environment variable holding the DigitalOcean API token.
pub const DIGITALOCEAN_TOKEN_VAR: &str = "DIGITALOCEAN_TOKEN";

/// Configuration file names searched for, in order.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["terrace.yaml", "terrace.yml"];

/// Loads declared configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory `.env` is looked up in.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable or malformed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeclaredConfig> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        if !path.exists() {
            return Err(TerraceError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TerraceError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not match the configuration layout.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeclaredConfig> {
        let config: DeclaredConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = e
                .location()
                .map(|loc| format!("line {}, column {}", loc.line(), loc.column()))
                .or_else(|| source.map(|p| p.display().to_string()));
            TerraceError::Config(ConfigError::ParseError {
                message: e.to_string(),
                location,
            })
        })?;

        debug!(
            project = %config.project.name,
            resources = config.resources.len(),
            "Parsed configuration"
        );
        Ok(config)
    }

    /// Loads configuration and applies `TERRACE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or an override is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeclaredConfig> {
        let mut config = self.load_file(path)?;
        apply_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                TerraceError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        }

        Ok(())
    }

    /// Reads the DigitalOcean API token from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnvVar`] if the token is not set.
    pub fn digitalocean_token() -> Result<String> {
        std::env::var(DIGITALOCEAN_TOKEN_VAR).map_err(|_| {
            TerraceError::Config(ConfigError::MissingEnvVar {
                name: String::from(DIGITALOCEAN_TOKEN_VAR),
            })
        })
    }
}

/// Applies overrides looked up through `var`.
fn apply_overrides(
    config: &mut DeclaredConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(name) = var("TERRACE_PROJECT_NAME") {
        debug!("Overriding project.name from environment");
        config.project.name = name;
    }
    if let Some(environment) = var("TERRACE_PROJECT_ENVIRONMENT") {
        debug!("Overriding project.environment from environment");
        config.project.environment = environment;
    }
    if let Some(bucket) = var("TERRACE_STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }
    if let Some(prefix) = var("TERRACE_STATE_PREFIX") {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }
    if let Some(raw) = var("TERRACE_PARALLELISM") {
        config.apply.parallelism = raw.parse().map_err(|_| {
            TerraceError::Config(ConfigError::validation(
                format!("TERRACE_PARALLELISM must be a positive integer, got {raw:?}"),
                "apply.parallelism",
            ))
        })?;
    }
    Ok(())
}

/// Finds the configuration file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();

    for dir in start.ancestors() {
        for filename in DEFAULT_CONFIG_FILES {
            let candidate = dir.join(filename);
            if candidate.exists() {
                debug!("Found configuration file {}", candidate.display());
                return Ok(candidate);
            }
        }
    }

    Err(TerraceError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
