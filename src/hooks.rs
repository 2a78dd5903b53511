//! External hook seams invoked around migration execution: tenant backup
//! before a batch, notifications after each tenant's outcome.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::apply::ApplyResult;
use crate::error::MigrateResult;
use crate::registry::Tenant;

/// Invoked before the first migration of a batch when
/// `backup_before_migration` is enabled.
#[async_trait]
pub trait BackupHook: Send + Sync {
    async fn backup(&self, tenant: &Tenant) -> MigrateResult<()>;
}

/// Invoked after each tenant's apply outcome, gated by the notification
/// settings flags.
#[async_trait]
pub trait NotificationHook: Send + Sync {
    async fn migration_completed(&self, result: &ApplyResult, recipients: &[String]);

    async fn migration_failed(&self, result: &ApplyResult, recipients: &[String]);
}

/// Hook implementation that does nothing
#[derive(Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl BackupHook for NoopHooks {
    async fn backup(&self, _tenant: &Tenant) -> MigrateResult<()> {
        Ok(())
    }
}

#[async_trait]
impl NotificationHook for NoopHooks {
    async fn migration_completed(&self, _result: &ApplyResult, _recipients: &[String]) {}

    async fn migration_failed(&self, _result: &ApplyResult, _recipients: &[String]) {}
}

/// Hook implementation that emits structured log events, useful when no
/// real backup or mail infrastructure is wired in.
#[derive(Default, Clone, Copy)]
pub struct LoggingHooks;

#[async_trait]
impl BackupHook for LoggingHooks {
    async fn backup(&self, tenant: &Tenant) -> MigrateResult<()> {
        info!(tenant_id = %tenant.id, tenant_code = %tenant.code, "pre-migration backup requested");
        Ok(())
    }
}

#[async_trait]
impl NotificationHook for LoggingHooks {
    async fn migration_completed(&self, result: &ApplyResult, recipients: &[String]) {
        info!(
            tenant_id = %result.tenant_id,
            applied = result.applied_migrations.len(),
            recipients = recipients.len(),
            "migration batch completed"
        );
    }

    async fn migration_failed(&self, result: &ApplyResult, recipients: &[String]) {
        warn!(
            tenant_id = %result.tenant_id,
            error = result.error.as_deref().unwrap_or("unknown"),
            recipients = recipients.len(),
            "migration batch failed"
        );
    }
}
