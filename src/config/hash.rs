//! Configuration hashing for change detection.
//!
//! The hash of the declared configuration is recorded in state after each
//! apply and stamped on plans, so `plan` can tell whether anything declared
//! changed since the last run.

use sha2::{Digest, Sha256};

use super::spec::{DeclaredConfig, ResourceConfig};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the project identity and every declared resource.
    ///
    /// Resource order does not affect the hash.
    #[must_use]
    pub fn hash_config(&self, config: &DeclaredConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update([0]);
        hasher.update(config.project.environment.as_bytes());

        let mut resource_hashes: Vec<String> =
            config.resources.iter().map(|r| self.hash_resource(r)).collect();
        resource_hashes.sort_unstable();
        for hash in resource_hashes {
            hasher.update(hash.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.resource_type.as_bytes());
        hasher.update([0]);
        hasher.update(resource.name.as_bytes());
        hasher.update([0]);

        let mut deps: Vec<&String> = resource.depends_on.iter().collect();
        deps.sort_unstable();
        deps.dedup();
        for dep in deps {
            hasher.update(dep.as_bytes());
            hasher.update([0]);
        }

        // serde_json maps are key-sorted, so this rendering is canonical
        let attributes = serde_json::Value::Object(resource.attributes.clone());
        hasher.update(attributes.to_string().as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        hash1.len() == hash2.len()
            && hash1
                .bytes()
                .zip(hash2.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}
