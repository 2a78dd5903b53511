//! Rollback engine: reverts the most recently applied migration of one
//! tenant/module pair using the catalog's backward script.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::catalog::MigrationCatalog;
use crate::error::{MigrateError, MigrateResult};
use crate::lock::TenantLocks;
use crate::registry::TenantRegistry;
use crate::state::TenantStateStore;
use crate::status::diff_module;

/// Report of one successful rollback
#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub tenant_id: Uuid,
    pub tenant_name: String,
    pub module: String,
    pub migration_name: String,
    pub rolled_back_at: DateTime<Utc>,
}

pub struct RollbackEngine {
    registry: Arc<dyn TenantRegistry>,
    catalog: Arc<dyn MigrationCatalog>,
    state: Arc<dyn TenantStateStore>,
    locks: TenantLocks,
}

impl RollbackEngine {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        catalog: Arc<dyn MigrationCatalog>,
        state: Arc<dyn TenantStateStore>,
        locks: TenantLocks,
    ) -> Self {
        Self {
            registry,
            catalog,
            state,
            locks,
        }
    }

    /// Roll back `migration_name`, which must be the latest applied
    /// migration for the tenant and module.
    ///
    /// Fails with `OutOfOrderRollback` otherwise, with `NoBackwardScript`
    /// when the descriptor carries none, and leaves state untouched in
    /// both cases.
    pub async fn rollback(
        &self,
        tenant_id: Uuid,
        module: &str,
        migration_name: &str,
    ) -> MigrateResult<RollbackResult> {
        let tenant = self.registry.tenant(tenant_id).await?;
        let descriptor = self.catalog.descriptor(module, migration_name).await?;
        if !descriptor.has_backward_script {
            return Err(MigrateError::NoBackwardScript(migration_name.to_string()));
        }

        let _guard = self.locks.try_acquire(tenant.id)?;
        let conn = self.state.connect(&tenant).await?;

        let descriptors = self.catalog.descriptors(module).await?;
        let ledger = conn.applied(module).await?;
        let (_, applied) = diff_module(&descriptors, &ledger);
        let latest = applied.last().cloned().unwrap_or_default();
        if latest != migration_name {
            return Err(MigrateError::OutOfOrderRollback {
                module: module.to_string(),
                requested: migration_name.to_string(),
                latest: if latest.is_empty() {
                    "<none>".to_string()
                } else {
                    latest
                },
            });
        }

        let script = self
            .catalog
            .backward_script(module, migration_name, conn.schema())
            .await?
            .ok_or_else(|| MigrateError::NoBackwardScript(migration_name.to_string()))?;

        let mut tx = conn.begin().await?;
        if let Err(e) = tx.execute_script(&script).await {
            tx.rollback().await?;
            return Err(MigrateError::ApplyFailure {
                name: migration_name.to_string(),
                message: format!("backward script failed: {e}"),
            });
        }
        tx.remove_applied(module, migration_name).await?;
        tx.commit().await?;

        info!(
            tenant_id = %tenant.id,
            module,
            migration = migration_name,
            "migration rolled back"
        );

        Ok(RollbackResult {
            tenant_id: tenant.id,
            tenant_name: tenant.name,
            module: module.to_string(),
            migration_name: migration_name.to_string(),
            rolled_back_at: Utc::now(),
        })
    }
}
