//! Content-source credentials
//!
//! Credentials are persisted only as one-way hashes. The plaintext a live call
//! needs is held transiently in a bounded [`CredentialCache`] that is handed by
//! reference to whichever component talks to the content source.
//!
//! - [`hash`]: hashing, verification and detection of legacy stored values
//! - [`cache`]: the per-process plaintext cache with rotation-aware lookups

mod cache;
mod hash;

pub use cache::{CredentialCache, CredentialCacheConfig};
pub use hash::{
    hash_credential, upgrade_stored, verify_credential, CredentialHash, StoredCredential,
    HASH_PREFIX, LEGACY_KEY_PREFIX,
};

use std::fmt;

/// A plaintext credential
///
/// Never printed: `Debug` and `Display` are redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a plaintext credential
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the plaintext for a live call
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check for an empty or whitespace-only credential
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
