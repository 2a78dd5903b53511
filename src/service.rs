//! Migration service facade: the full orchestration surface over the
//! status aggregator, apply/rollback engines, preview generator,
//! scheduler, and settings store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::apply::{ApplyEngine, ApplyResult};
use crate::catalog::MigrationCatalog;
use crate::error::MigrateResult;
use crate::hooks::{BackupHook, NoopHooks, NotificationHook};
use crate::lock::TenantLocks;
use crate::preview::{PreviewGenerator, PreviewResult, TimingHistory};
use crate::registry::TenantRegistry;
use crate::rollback::{RollbackEngine, RollbackResult};
use crate::schedule::{JobStore, MemoryJobStore, ScheduledMigrationJob, Scheduler, SchedulerHandle};
use crate::settings::{MemorySettingsStore, MigrationSettings, SettingsStore};
use crate::state::TenantStateStore;
use crate::status::{StatusAggregator, TenantMigrationStatus};

/// Applied-migration history for one tenant
#[derive(Debug, Clone, Serialize)]
pub struct MigrationHistory {
    pub tenant_id: Uuid,
    pub tenant_name: String,
    pub tenant_code: String,
    /// Catalog-ordered applied names per module
    pub applied_by_module: std::collections::BTreeMap<String, Vec<String>>,
    pub total_applied: usize,
}

/// Builder for [`MigrationService`]
pub struct MigrationServiceBuilder {
    registry: Arc<dyn TenantRegistry>,
    catalog: Arc<dyn MigrationCatalog>,
    state: Arc<dyn TenantStateStore>,
    settings: Option<Arc<dyn SettingsStore>>,
    jobs: Option<Arc<dyn JobStore>>,
    backup: Option<Arc<dyn BackupHook>>,
    notifier: Option<Arc<dyn NotificationHook>>,
}

impl MigrationServiceBuilder {
    pub fn settings_store(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn backup_hook(mut self, backup: Arc<dyn BackupHook>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn notification_hook(mut self, notifier: Arc<dyn NotificationHook>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> MigrationService {
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(MemorySettingsStore::default()));
        let jobs = self
            .jobs
            .unwrap_or_else(|| Arc::new(MemoryJobStore::new()));
        let backup = self.backup.unwrap_or_else(|| Arc::new(NoopHooks));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(NoopHooks));

        let locks = TenantLocks::new();
        let timings = Arc::new(TimingHistory::new());

        let aggregator = StatusAggregator::new(
            self.registry.clone(),
            self.catalog.clone(),
            self.state.clone(),
        );
        let apply = Arc::new(ApplyEngine::new(
            self.registry.clone(),
            self.catalog.clone(),
            self.state.clone(),
            locks.clone(),
            settings.clone(),
            backup,
            notifier,
            timings.clone(),
        ));
        let rollback = RollbackEngine::new(
            self.registry.clone(),
            self.catalog.clone(),
            self.state.clone(),
            locks,
        );
        let preview = PreviewGenerator::new(self.registry.clone(), self.catalog.clone(), timings);
        let scheduler = Arc::new(Scheduler::new(
            jobs,
            apply.clone(),
            self.registry.clone(),
            settings.clone(),
        ));

        MigrationService {
            registry: self.registry,
            state: self.state,
            catalog: self.catalog,
            settings,
            aggregator,
            apply,
            rollback,
            preview,
            scheduler,
        }
    }
}

/// One migration orchestrator instance
pub struct MigrationService {
    registry: Arc<dyn TenantRegistry>,
    state: Arc<dyn TenantStateStore>,
    catalog: Arc<dyn MigrationCatalog>,
    settings: Arc<dyn SettingsStore>,
    aggregator: StatusAggregator,
    apply: Arc<ApplyEngine>,
    rollback: RollbackEngine,
    preview: PreviewGenerator,
    scheduler: Arc<Scheduler>,
}

impl MigrationService {
    pub fn builder(
        registry: Arc<dyn TenantRegistry>,
        catalog: Arc<dyn MigrationCatalog>,
        state: Arc<dyn TenantStateStore>,
    ) -> MigrationServiceBuilder {
        MigrationServiceBuilder {
            registry,
            catalog,
            state,
            settings: None,
            jobs: None,
            backup: None,
            notifier: None,
        }
    }

    /// Fresh per-tenant pending/applied status for every active tenant
    pub async fn list_pending_migrations(&self) -> MigrateResult<Vec<TenantMigrationStatus>> {
        self.aggregator.pending_migrations().await
    }

    /// Apply pending migrations for one tenant
    pub async fn apply(
        &self,
        tenant_id: Uuid,
        module: Option<&str>,
    ) -> MigrateResult<ApplyResult> {
        self.apply.apply(tenant_id, module).await
    }

    /// Apply pending migrations across every active tenant
    pub async fn apply_all(&self) -> MigrateResult<Vec<ApplyResult>> {
        self.apply.apply_all().await
    }

    /// Preview a migration's script and impact without executing it
    pub async fn preview(
        &self,
        tenant_id: Uuid,
        module: &str,
        migration_name: &str,
    ) -> MigrateResult<PreviewResult> {
        self.preview.preview(tenant_id, module, migration_name).await
    }

    /// Roll back the latest applied migration of a tenant/module pair
    pub async fn rollback(
        &self,
        tenant_id: Uuid,
        module: &str,
        migration_name: &str,
    ) -> MigrateResult<RollbackResult> {
        self.rollback.rollback(tenant_id, module, migration_name).await
    }

    /// Open scheduled jobs, ordered by scheduled time
    pub async fn list_scheduled(&self) -> MigrateResult<Vec<ScheduledMigrationJob>> {
        self.scheduler.list().await
    }

    /// Create a deferred apply job
    pub async fn schedule(
        &self,
        tenant_id: Uuid,
        scheduled_time: DateTime<Utc>,
        module: Option<String>,
        migration_name: Option<String>,
        created_by: Option<String>,
    ) -> MigrateResult<Uuid> {
        self.scheduler
            .schedule(tenant_id, scheduled_time, module, migration_name, created_by)
            .await
    }

    /// Cancel a scheduled job that has not started running
    pub async fn cancel_scheduled(&self, schedule_id: Uuid) -> MigrateResult<()> {
        self.scheduler.cancel(schedule_id).await
    }

    pub async fn get_settings(&self) -> MigrationSettings {
        self.settings.get().await
    }

    pub async fn update_settings(&self, settings: MigrationSettings) -> MigrateResult<()> {
        self.settings.update(settings).await
    }

    /// Applied-migration history for one tenant. An unreachable tenant
    /// yields an empty history rather than an error.
    pub async fn history(&self, tenant_id: Uuid) -> MigrateResult<MigrationHistory> {
        let tenant = self.registry.tenant(tenant_id).await?;
        let status = self.aggregator.tenant_status(&tenant).await;
        let applied_by_module = status.applied_by_module;
        let total_applied = applied_by_module.values().map(Vec::len).sum();
        Ok(MigrationHistory {
            tenant_id: tenant.id,
            tenant_name: tenant.name,
            tenant_code: tenant.code,
            applied_by_module,
            total_applied,
        })
    }

    /// Status-change observer: applies pending migrations for a freshly
    /// provisioned tenant when `auto_apply_migrations` is enabled.
    pub async fn on_tenant_provisioned(&self, tenant_id: Uuid) -> MigrateResult<Option<ApplyResult>> {
        if !self.settings.get().await.auto_apply_migrations {
            return Ok(None);
        }
        info!(%tenant_id, "auto-applying migrations for provisioned tenant");
        self.apply.apply(tenant_id, None).await.map(Some)
    }

    /// Run one scheduler sweep pass immediately
    pub async fn sweep(&self) -> MigrateResult<usize> {
        self.scheduler.sweep().await
    }

    /// Start the background sweep loop
    pub fn start_scheduler(&self) -> SchedulerHandle {
        self.scheduler.clone().spawn()
    }

    /// The catalog this orchestrator converges tenants on
    pub fn catalog(&self) -> &Arc<dyn MigrationCatalog> {
        &self.catalog
    }

    /// The tenant registry this orchestrator was built with
    pub fn registry(&self) -> &Arc<dyn TenantRegistry> {
        &self.registry
    }

    /// The per-tenant state store backing the ledgers
    pub fn state(&self) -> &Arc<dyn TenantStateStore> {
        &self.state
    }
}
