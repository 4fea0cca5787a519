//! Content-derived identity for set elements.
//!
//! Set-typed attributes are compared by the hash of each element's content,
//! never by position. Every element type contributes a canonical byte
//! encoding through [`ContentIdentity`]; the differ relies on that encoding
//! to report added and removed members.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of an element's canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementHash(String);

impl ElementHash {
    /// Returns the hash as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first 8 characters, for display.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for ElementHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Types that can be identified by their content.
pub trait ContentIdentity {
    /// Feeds a canonical, unambiguous encoding of `self` into the hasher.
    fn write_identity(&self, hasher: &mut Sha256);

    /// Computes the content hash of `self`.
    fn content_hash(&self) -> ElementHash {
        let mut hasher = Sha256::new();
        self.write_identity(&mut hasher);
        ElementHash(hex::encode(hasher.finalize()))
    }
}

/// Writes a length-prefixed byte string so adjacent fields cannot alias.
pub(crate) fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

impl ContentIdentity for str {
    fn write_identity(&self, hasher: &mut Sha256) {
        hasher.update([b's']);
        write_bytes(hasher, self.as_bytes());
    }
}

impl ContentIdentity for String {
    fn write_identity(&self, hasher: &mut Sha256) {
        self.as_str().write_identity(hasher);
    }
}

impl ContentIdentity for i64 {
    fn write_identity(&self, hasher: &mut Sha256) {
        hasher.update([b'i']);
        hasher.update(self.to_be_bytes());
    }
}

impl ContentIdentity for bool {
    fn write_identity(&self, hasher: &mut Sha256) {
        hasher.update([b'b', u8::from(*self)]);
    }
}
