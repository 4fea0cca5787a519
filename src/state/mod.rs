//! Durable state.
//!
//! The state document records every managed resource instance: provider id,
//! last-known attributes, dependencies, plus a bounded operation history.
//! Backends store it locally (atomic rename) or in S3.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_RENEW_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    HistoryEntry, HistoryOperation, MAX_HISTORY, ResourceInstance, STATE_FORMAT_VERSION, StateSnapshot,
};
