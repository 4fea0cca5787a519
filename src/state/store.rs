//! State store trait definition.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::StateSnapshot;
use crate::error::Result;

/// A durable home for the state document.
///
/// `save` must be atomic: a crash during `save` never leaves a partially
/// written document for the next `load`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state, or `None` if none has been saved yet.
    async fn load(&self) -> Result<Option<StateSnapshot>>;

    /// Saves the state, replacing the previous document.
    async fn save(&self, state: &StateSnapshot) -> Result<()>;

    /// Deletes the state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the advisory lock for `operation`.
    ///
    /// An empty `holder` is replaced by a generated process identifier.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Extends the expiry of a lock this process holds and returns the
    /// renewed record.
    ///
    /// Fails with [`StateError::LockLost`](crate::error::StateError::LockLost)
    /// when the stored lock is missing or carries another id.
    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases the lock if it is still held under `lock_id`.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by an unexpired lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.get_lock_info().await?.is_some_and(|lock| !lock.is_expired()))
    }

    /// Backend name, for display.
    fn backend_type(&self) -> &'static str;
}
