//! Credential hashing
//!
//! Stored form is `sha256:<64 lowercase hex>`. Anything else found in the
//! store is legacy and gets upgraded by [`upgrade_stored`].

use super::Secret;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use std::fmt;

/// Prefix marking a current-format stored credential
pub const HASH_PREFIX: &str = "sha256:";

/// Prefix some early deployments wrapped plaintext keys in
pub const LEGACY_KEY_PREFIX: &str = "ghost-api-key:";

/// A credential in its at-rest form
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CredentialHash(String);

impl CredentialHash {
    /// Wrap a value read back from the store
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The stored representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this value is in the current hashed format
    pub fn is_current(&self) -> bool {
        matches!(StoredCredential::classify(&self.0), StoredCredential::Current)
    }
}

impl fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.0.chars().take(HASH_PREFIX.len() + 8).collect();
        write!(f, "CredentialHash({}…)", shown)
    }
}

/// What a stored credential value turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredCredential {
    /// `sha256:<hex>`
    Current,
    /// A bare 64-char hex digest written before the prefix existed
    UnprefixedDigest,
    /// Anything else: a plaintext (possibly `ghost-api-key:`-wrapped) key
    Plaintext,
}

impl StoredCredential {
    /// Classify a raw stored value
    pub fn classify(value: &str) -> Self {
        if let Some(digest) = value.strip_prefix(HASH_PREFIX) {
            if is_sha256_hex(digest) {
                return StoredCredential::Current;
            }
            return StoredCredential::Plaintext;
        }
        if is_sha256_hex(value) {
            StoredCredential::UnprefixedDigest
        } else {
            StoredCredential::Plaintext
        }
    }
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn digest_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash a plaintext credential into its stored form
pub fn hash_credential(secret: &Secret) -> CredentialHash {
    CredentialHash(format!("{}{}", HASH_PREFIX, digest_hex(secret.expose())))
}

/// Check a plaintext candidate against a stored hash
pub fn verify_credential(stored: &CredentialHash, candidate: &Secret) -> bool {
    if candidate.is_blank() {
        return false;
    }
    let expected = hash_credential(candidate);
    constant_time_eq(stored.as_str().as_bytes(), expected.as_str().as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Compute the upgraded stored form for a legacy value
///
/// Returns `None` when the value is already current.
pub fn upgrade_stored(value: &str) -> Option<CredentialHash> {
    match StoredCredential::classify(value) {
        StoredCredential::Current => None,
        StoredCredential::UnprefixedDigest => Some(CredentialHash(format!(
            "{}{}",
            HASH_PREFIX,
            value.to_ascii_lowercase()
        ))),
        StoredCredential::Plaintext => {
            let plaintext = value.strip_prefix(LEGACY_KEY_PREFIX).unwrap_or(value);
            Some(hash_credential(&Secret::new(plaintext)))
        }
    }
}
