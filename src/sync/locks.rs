//! Per-tenant mutual exclusion
//!
//! A tenant's fetch-reconcile-dispatch sequence runs under that tenant's
//! lock, so a manual trigger and the timer cycle can never both see "no
//! watermark" for the same item and send it twice. Different tenants never
//! contend.

use crate::ids::TenantId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of one tenant's pass
pub type TenantGuard = OwnedMutexGuard<()>;

/// Lock table keyed by tenant id
#[derive(Default)]
pub struct TenantLocks {
    locks: Mutex<HashMap<TenantId, Arc<AsyncMutex<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, tenant_id: &TenantId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(tenant_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for and take the tenant's lock
    pub async fn acquire(&self, tenant_id: &TenantId) -> TenantGuard {
        self.slot(tenant_id).lock_owned().await
    }

    /// Take the lock only if nobody holds it
    #[cfg(test)]
    fn try_acquire(&self, tenant_id: &TenantId) -> Option<TenantGuard> {
        self.slot(tenant_id).try_lock_owned().ok()
    }

    /// Drop the entry of a removed tenant unless someone holds or awaits it
    pub fn forget(&self, tenant_id: &TenantId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(tenant_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            locks.remove(tenant_id);
        }
    }

    /// Number of tenants with a lock entry
    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
