//! Apply engine: executes a tenant's pending migrations in catalog order,
//! one transaction per migration, stopping the batch at the first failure.
//!
//! Migrations committed before a failure stay applied; each migration is
//! independently consistent. Within one tenant and module execution is
//! strictly sequential, and the tenant's advisory lock is held for the
//! whole batch.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::catalog::{MigrationCatalog, MigrationDescriptor};
use crate::error::{MigrateError, MigrateResult};
use crate::hooks::{BackupHook, NotificationHook};
use crate::lock::TenantLocks;
use crate::preview::TimingHistory;
use crate::registry::{Tenant, TenantRegistry};
use crate::settings::{MigrationSettings, SettingsStore};
use crate::state::{AppliedMigrationRecord, TenantConnection, TenantStateStore};
use crate::status::diff_module;

/// Report of one apply invocation for one tenant. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    pub tenant_id: Uuid,
    pub tenant_name: String,
    pub success: bool,
    /// Names applied before the batch finished or stopped, in order
    pub applied_migrations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApplyResult {
    fn succeeded(tenant: &Tenant, applied: Vec<String>) -> Self {
        Self {
            tenant_id: tenant.id,
            tenant_name: tenant.name.clone(),
            success: true,
            applied_migrations: applied,
            error: None,
        }
    }

    fn failed(tenant: &Tenant, applied: Vec<String>, error: String) -> Self {
        Self {
            tenant_id: tenant.id,
            tenant_name: tenant.name.clone(),
            success: false,
            applied_migrations: applied,
            error: Some(error),
        }
    }
}

/// Executes pending migrations for tenants
pub struct ApplyEngine {
    registry: Arc<dyn TenantRegistry>,
    catalog: Arc<dyn MigrationCatalog>,
    state: Arc<dyn TenantStateStore>,
    locks: TenantLocks,
    settings: Arc<dyn SettingsStore>,
    backup: Arc<dyn BackupHook>,
    notifier: Arc<dyn NotificationHook>,
    timings: Arc<TimingHistory>,
}

impl ApplyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        catalog: Arc<dyn MigrationCatalog>,
        state: Arc<dyn TenantStateStore>,
        locks: TenantLocks,
        settings: Arc<dyn SettingsStore>,
        backup: Arc<dyn BackupHook>,
        notifier: Arc<dyn NotificationHook>,
        timings: Arc<TimingHistory>,
    ) -> Self {
        Self {
            registry,
            catalog,
            state,
            locks,
            settings,
            backup,
            notifier,
            timings,
        }
    }

    /// Catalog shared with collaborators that validate migration names
    pub fn catalog(&self) -> &Arc<dyn MigrationCatalog> {
        &self.catalog
    }

    /// Apply all pending migrations for one tenant, optionally scoped to a
    /// single module.
    ///
    /// Returns `Err` only for malformed requests (unknown tenant or
    /// module) and lock contention; connectivity and script failures are
    /// captured into the returned [`ApplyResult`].
    pub async fn apply(&self, tenant_id: Uuid, module: Option<&str>) -> MigrateResult<ApplyResult> {
        let tenant = self.registry.tenant(tenant_id).await?;
        if let Some(module) = module {
            // Validate before any tenant storage is touched
            self.catalog.descriptors(module).await?;
        }
        self.apply_tenant(&tenant, module, None).await
    }

    /// Apply pending migrations for one module up to and including
    /// `migration_name`. Used by scheduled jobs targeting one migration;
    /// applying the predecessors first preserves the catalog-prefix
    /// invariant.
    pub async fn apply_up_to(
        &self,
        tenant_id: Uuid,
        module: &str,
        migration_name: &str,
    ) -> MigrateResult<ApplyResult> {
        let tenant = self.registry.tenant(tenant_id).await?;
        self.catalog.descriptor(module, migration_name).await?;
        self.apply_tenant(&tenant, Some(module), Some(migration_name))
            .await
    }

    /// Apply pending migrations for every active tenant, isolating
    /// failures per tenant. Always returns one result per tenant.
    pub async fn apply_all(&self) -> MigrateResult<Vec<ApplyResult>> {
        let tenants = self.registry.active_tenants().await?;
        info!(tenants = tenants.len(), "applying migrations across all tenants");

        let mut results = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            // Lock is acquired and released per tenant so one slow tenant
            // does not block the rest of the fleet.
            let result = match self.apply_tenant(&tenant, None, None).await {
                Ok(result) => result,
                Err(e) => ApplyResult::failed(&tenant, Vec::new(), e.to_string()),
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn apply_tenant(
        &self,
        tenant: &Tenant,
        module: Option<&str>,
        up_to: Option<&str>,
    ) -> MigrateResult<ApplyResult> {
        let _guard = self.locks.try_acquire(tenant.id)?;
        let settings = self.settings.get().await;

        let result = self.run_batch(tenant, module, up_to, &settings).await;
        match &result {
            Ok(r) if r.success => {
                info!(
                    tenant_id = %tenant.id,
                    applied = r.applied_migrations.len(),
                    "apply batch finished"
                );
            }
            Ok(r) => {
                error!(
                    tenant_id = %tenant.id,
                    applied = r.applied_migrations.len(),
                    error = r.error.as_deref().unwrap_or("unknown"),
                    "apply batch stopped on failure"
                );
            }
            Err(_) => {}
        }

        if let Ok(r) = &result {
            self.notify(r, &settings).await;
        }
        result
    }

    async fn run_batch(
        &self,
        tenant: &Tenant,
        module: Option<&str>,
        up_to: Option<&str>,
        settings: &MigrationSettings,
    ) -> MigrateResult<ApplyResult> {
        let conn = match self.state.connect(tenant).await {
            Ok(conn) => conn,
            Err(e) => return Ok(ApplyResult::failed(tenant, Vec::new(), e.to_string())),
        };

        let plan = match self.plan(&*conn, module, up_to).await {
            Ok(plan) => plan,
            Err(e) => return Ok(ApplyResult::failed(tenant, Vec::new(), e.to_string())),
        };

        if plan.is_empty() {
            debug!(tenant_id = %tenant.id, "no pending migrations");
            return Ok(ApplyResult::succeeded(tenant, Vec::new()));
        }

        if settings.backup_before_migration {
            if let Err(e) = self.backup.backup(tenant).await {
                return Ok(ApplyResult::failed(
                    tenant,
                    Vec::new(),
                    format!("pre-migration backup failed: {e}"),
                ));
            }
        }

        let mut applied = Vec::new();
        for descriptor in plan {
            match self
                .apply_one(tenant, &*conn, &descriptor, settings)
                .await
            {
                Ok(()) => applied.push(descriptor.name),
                Err(e) => {
                    // Stop the batch; earlier commits stay applied
                    return Ok(ApplyResult::failed(tenant, applied, e.to_string()));
                }
            }
        }

        Ok(ApplyResult::succeeded(tenant, applied))
    }

    /// Pending descriptors across the requested modules, catalog order
    async fn plan(
        &self,
        conn: &dyn TenantConnection,
        module: Option<&str>,
        up_to: Option<&str>,
    ) -> MigrateResult<Vec<MigrationDescriptor>> {
        let modules = match module {
            Some(m) => vec![m.to_string()],
            None => self.catalog.modules().await?,
        };

        let mut plan = Vec::new();
        for module in &modules {
            let descriptors = self.catalog.descriptors(module).await?;
            let ledger = conn.applied(module).await?;
            let (mut pending, _) = diff_module(&descriptors, &ledger);
            if let Some(last) = up_to {
                match pending.iter().position(|d| d.name == last) {
                    Some(i) => pending.truncate(i + 1),
                    // Already applied, nothing pending up to it
                    None => pending.clear(),
                }
            }
            plan.extend(pending);
        }
        Ok(plan)
    }

    async fn apply_one(
        &self,
        tenant: &Tenant,
        conn: &dyn TenantConnection,
        descriptor: &MigrationDescriptor,
        settings: &MigrationSettings,
    ) -> MigrateResult<()> {
        debug!(
            tenant_id = %tenant.id,
            module = %descriptor.module,
            migration = %descriptor.name,
            "applying migration"
        );
        let script = self
            .catalog
            .forward_script(&descriptor.module, &descriptor.name, conn.schema())
            .await?;

        let mut tx = conn.begin().await?;
        let started = Instant::now();
        let executed = timeout(settings.timeout(), tx.execute_script(&script)).await;
        match executed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tx.rollback().await?;
                return Err(MigrateError::ApplyFailure {
                    name: descriptor.name.clone(),
                    message: e.to_string(),
                });
            }
            Err(_) => {
                tx.rollback().await?;
                return Err(MigrateError::Timeout {
                    name: descriptor.name.clone(),
                    timeout: settings.timeout(),
                });
            }
        }

        tx.record_applied(AppliedMigrationRecord {
            tenant_id: tenant.id,
            module: descriptor.module.clone(),
            migration_name: descriptor.name.clone(),
            applied_at: Utc::now(),
            checksum: descriptor.checksum.clone(),
        })
        .await?;
        tx.commit().await?;

        self.timings
            .record(descriptor.affected_tables.len(), started.elapsed());
        Ok(())
    }

    async fn notify(&self, result: &ApplyResult, settings: &MigrationSettings) {
        if result.success && result.applied_migrations.is_empty() {
            return;
        }
        let recipients = &settings.notification_emails;
        if result.success && settings.notify_on_migration_complete {
            self.notifier.migration_completed(result, recipients).await;
        } else if !result.success && settings.notify_on_migration_failure {
            self.notifier.migration_failed(result, recipients).await;
        }
    }
}
