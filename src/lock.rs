//! Per-tenant advisory locks.
//!
//! Apply, rollback, and claimed scheduler jobs must hold a tenant's lock
//! before touching its state store. Acquisition fails fast with
//! `MigrationInProgress` instead of queuing, so operators get an
//! immediate signal on contention.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::{MigrateError, MigrateResult};

/// Registry of tenant locks for a single orchestrator instance
#[derive(Default, Clone)]
pub struct TenantLocks {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the tenant's exclusive lock, or fail fast if held
    pub fn try_acquire(&self, tenant_id: Uuid) -> MigrateResult<TenantLockGuard> {
        let mut held = self.held.lock().expect("tenant lock registry poisoned");
        if !held.insert(tenant_id) {
            return Err(MigrateError::MigrationInProgress(tenant_id));
        }
        Ok(TenantLockGuard {
            tenant_id,
            held: self.held.clone(),
        })
    }

    /// Whether a tenant's lock is currently held
    pub fn is_held(&self, tenant_id: Uuid) -> bool {
        self.held
            .lock()
            .expect("tenant lock registry poisoned")
            .contains(&tenant_id)
    }
}

/// Releases the tenant's lock when dropped
pub struct TenantLockGuard {
    tenant_id: Uuid,
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl TenantLockGuard {
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }
}

impl Drop for TenantLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.tenant_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_fast() {
        let locks = TenantLocks::new();
        let tenant = Uuid::new_v4();

        let guard = locks.try_acquire(tenant).unwrap();
        assert!(matches!(
            locks.try_acquire(tenant),
            Err(MigrateError::MigrationInProgress(id)) if id == tenant
        ));
        drop(guard);
        assert!(locks.try_acquire(tenant).is_ok());
    }

    #[test]
    fn locks_are_independent_per_tenant() {
        let locks = TenantLocks::new();
        let _a = locks.try_acquire(Uuid::new_v4()).unwrap();
        let _b = locks.try_acquire(Uuid::new_v4()).unwrap();
        assert!(locks.is_held(_a.tenant_id()));
        assert!(locks.is_held(_b.tenant_id()));
    }
}
