//! Bounded in-memory cache of plaintext credentials
//!
//! Entries are keyed by tenant and remember the stored hash they were verified
//! against. A lookup with a different stored hash (the credential was rotated
//! through another path) misses and drops the stale entry.

use super::{hash_credential, verify_credential, CredentialHash, Secret};
use crate::ids::TenantId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cache sizing and expiry
#[derive(Debug, Clone)]
pub struct CredentialCacheConfig {
    /// Maximum number of tenants held at once
    pub capacity: usize,

    /// Optional time-to-live for each entry
    pub ttl: Option<Duration>,
}

impl Default for CredentialCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: None,
        }
    }
}

struct Entry {
    secret: Secret,
    verified_against: CredentialHash,
    inserted_at: Instant,
}

/// Per-process plaintext credential cache
pub struct CredentialCache {
    config: CredentialCacheConfig,
    entries: Mutex<HashMap<TenantId, Entry>>,
}

impl CredentialCache {
    /// Create an empty cache
    pub fn new(config: CredentialCacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<TenantId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verify `secret` against the stored hash and cache it on success
    ///
    /// Returns whether the secret matched.
    pub fn admit(&self, tenant_id: &TenantId, secret: Secret, stored: &CredentialHash) -> bool {
        if !verify_credential(stored, &secret) {
            tracing::warn!(tenant_id = %tenant_id, "Rejected credential that does not match stored hash");
            return false;
        }
        self.put(tenant_id.clone(), secret, stored.clone());
        true
    }

    /// Cache a freshly rotated credential, returning its stored form
    pub fn rotate(&self, tenant_id: &TenantId, secret: Secret) -> CredentialHash {
        let hash = hash_credential(&secret);
        self.put(tenant_id.clone(), secret, hash.clone());
        tracing::debug!(tenant_id = %tenant_id, "Rotated cached credential");
        hash
    }

    fn put(&self, tenant_id: TenantId, secret: Secret, verified_against: CredentialHash) {
        let mut entries = self.entries();

        if !entries.contains_key(&tenant_id) && entries.len() >= self.config.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(tenant_id = %oldest, "Evicting oldest cached credential");
                entries.remove(&oldest);
            }
        }

        if self.config.capacity > 0 {
            entries.insert(
                tenant_id,
                Entry {
                    secret,
                    verified_against,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    /// Look up the plaintext for a tenant whose stored hash is `stored`
    pub fn get(&self, tenant_id: &TenantId, stored: &CredentialHash) -> Option<Secret> {
        let mut entries = self.entries();

        let stale = match entries.get(tenant_id) {
            None => return None,
            Some(entry) => {
                let expired = self
                    .config
                    .ttl
                    .is_some_and(|ttl| entry.inserted_at.elapsed() > ttl);
                expired || &entry.verified_against != stored
            }
        };

        if stale {
            entries.remove(tenant_id);
            return None;
        }

        entries.get(tenant_id).map(|e| e.secret.clone())
    }

    /// Drop a tenant's cached credential
    pub fn invalidate(&self, tenant_id: &TenantId) {
        if self.entries().remove(tenant_id).is_some() {
            tracing::debug!(tenant_id = %tenant_id, "Invalidated cached credential");
        }
    }

    /// Number of cached credentials
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new(CredentialCacheConfig::default())
    }
}
