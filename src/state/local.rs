//! Local file-based state storage backend.
//!
//! State lives in `.terrace/state.json` next to the configuration. Saves go
//! through a temporary file that is synced and then renamed over the
//! previous document, so readers only ever see a complete snapshot.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StateError, TerraceError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::StateSnapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".terrace";

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    base_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store under `.terrace` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| TerraceError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store in a custom directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                TerraceError::State(StateError::write(format!("Failed to create state directory: {e}")))
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(TerraceError::State(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            TerraceError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> std::io::Result<()> {
        let content = serde_json::to_vec_pretty(lock_info)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;
        file.write_all(&content).await?;
        file.sync_all().await
    }

    /// Overwrites the lock file through a temporary file and rename.
    async fn replace_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let temp_path = self.lock_path.with_extension("lock.tmp");
        let content = serde_json::to_vec_pretty(lock_info).map_err(|e| {
            TerraceError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        fs::write(&temp_path, content).await.map_err(|e| {
            TerraceError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;
        fs::rename(&temp_path, &self.lock_path).await.map_err(|e| {
            TerraceError::State(StateError::LockFailed {
                message: format!("Failed to replace lock file: {e}"),
            })
        })
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TerraceError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(TerraceError::State(StateError::Corrupted {
                    message: format!("Failed to read state file: {e}"),
                }));
            }
        };

        let state = StateSnapshot::from_json(&content)?;
        debug!(serial = state.serial, "Loaded state from {}", self.state_path.display());
        Ok(Some(state))
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        self.ensure_dir().await?;

        let content = state.to_json()?;
        let temp_path = self.state_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            TerraceError::State(StateError::write(format!("Failed to create temp state file: {e}")))
        })?;
        file.write_all(content.as_bytes()).await.map_err(|e| {
            TerraceError::State(StateError::write(format!("Failed to write state file: {e}")))
        })?;
        file.sync_all().await.map_err(|e| {
            TerraceError::State(StateError::write(format!("Failed to sync state file: {e}")))
        })?;
        drop(file);

        fs::rename(&temp_path, &self.state_path).await.map_err(|e| {
            TerraceError::State(StateError::write(format!("Failed to rename state file: {e}")))
        })?;

        debug!(serial = state.serial, "Saved state to {}", self.state_path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file {}", self.state_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TerraceError::State(StateError::write(format!(
                    "Failed to delete state file: {e}"
                ))));
            }
        }

        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);

        // Second pass only runs after an expired lock was removed
        for _ in 0..2 {
            match self.create_lock_file(&lock_info).await {
                Ok(()) => {
                    info!(
                        "Acquired state lock {} for {operation} (expires in {LOCK_EXPIRY_SECS}s)",
                        lock_info.lock_id
                    );
                    return Ok(lock_info);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.read_lock_file().await? {
                    Some(existing) if !existing.is_expired() => {
                        return Err(TerraceError::State(StateError::LockedByOther {
                            holder: existing.holder,
                            since: existing.acquired_at.to_rfc3339(),
                        }));
                    }
                    _ => {
                        debug!("Expired lock found, taking over");
                        self.delete_lock_file().await?;
                    }
                },
                Err(e) => {
                    return Err(TerraceError::State(StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }));
                }
            }
        }

        Err(TerraceError::State(StateError::LockFailed {
            message: String::from("lock was taken by another process while replacing an expired lock"),
        }))
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock.lock_id => {}
            _ => return Err(TerraceError::State(StateError::lock_lost(&lock.lock_id))),
        }

        let mut renewed = lock.clone();
        renewed.refresh();
        self.replace_lock_file(&renewed).await?;
        debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await?;
        info!("Forcibly removed state lock");
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
