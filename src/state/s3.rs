//! S3-based state storage backend.
//!
//! Each save is a single `PutObject`, which S3 applies atomically, so a
//! reader sees either the previous or the new document. The lock object is
//! created with a conditional put so two writers cannot both take it.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StateError, TerraceError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::StateSnapshot;

const STATE_KEY: &str = "state.json";
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    prefix: String,
}

/// Outcome of a conditional put.
enum PutOutcome {
    Written,
    AlreadyExists,
}

impl S3StateStore {
    /// Creates a store using credentials from the AWS environment.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = match region {
            Some(region) => {
                aws_config::from_env()
                    .region(aws_config::Region::new(region.to_string()))
                    .load()
                    .await
            }
            None => aws_config::load_from_env().await,
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self.client.get_object().bucket(&self.bucket).key(key).send().await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    TerraceError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                String::from_utf8(bytes.to_vec()).map(Some).map_err(|e| {
                    TerraceError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(TerraceError::State(StateError::s3(format!("S3 get error: {service_err}"))))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: String, only_if_absent: bool) -> Result<PutOutcome> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into_bytes().into())
            .content_type("application/json");
        if only_if_absent {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(e) if e.raw_response().is_some_and(|r| r.status().as_u16() == 412) => {
                Ok(PutOutcome::AlreadyExists)
            }
            Err(e) => Err(TerraceError::State(StateError::s3(format!("S3 put error: {e}")))),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| TerraceError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{p}/"),
        _ => String::new(),
    }
}

fn parse_lock(content: &str) -> Result<LockInfo> {
    serde_json::from_str(content).map_err(|e| {
        TerraceError::State(StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })
    })
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => {
                let state = StateSnapshot::from_json(&json)?;
                debug!(serial = state.serial, "Loaded state for {}/{}", state.project, state.environment);
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &StateSnapshot) -> Result<()> {
        let key = self.key(STATE_KEY);
        self.put_object(&key, state.to_json()?, false).await?;
        debug!(serial = state.serial, "Saved state to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(STATE_KEY))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(TerraceError::State(StateError::s3(format!("S3 head error: {service_err}"))))
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        if let Some(content) = self.get_object(&key).await? {
            let existing = parse_lock(&content)?;
            if !existing.is_expired() {
                return Err(TerraceError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
            self.delete_object(&key).await?;
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            TerraceError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;

        match self.put_object(&key, content, true).await? {
            PutOutcome::Written => {
                info!(
                    "Acquired state lock {} for {operation} (expires in {LOCK_EXPIRY_SECS}s)",
                    lock_info.lock_id
                );
                Ok(lock_info)
            }
            PutOutcome::AlreadyExists => {
                let holder = match self.get_object(&key).await? {
                    Some(content) => parse_lock(&content)?.holder,
                    None => String::from("unknown"),
                };
                Err(TerraceError::State(StateError::LockedByOther {
                    holder,
                    since: String::from("just now"),
                }))
            }
        }
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let held = match self.get_object(&key).await? {
            Some(content) => parse_lock(&content)?.lock_id == lock.lock_id,
            None => false,
        };
        if !held {
            return Err(TerraceError::State(StateError::lock_lost(&lock.lock_id)));
        }

        let mut renewed = lock.clone();
        renewed.refresh();
        let content = serde_json::to_string_pretty(&renewed).map_err(|e| {
            TerraceError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        self.put_object(&key, content, false).await?;
        debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
        Ok(renewed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        if let Some(content) = self.get_object(&key).await? {
            let existing = parse_lock(&content)?;
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
                info!("Released state lock {lock_id}");
            } else {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
        }

        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_object(&self.key(LOCK_KEY)).await?;
        info!("Forcibly removed state lock");
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.key(LOCK_KEY)).await? {
            Some(content) => parse_lock(&content).map(Some),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
