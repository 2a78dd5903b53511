//! Migration preview: renders a migration's forward script for a tenant
//! and estimates its impact without executing anything.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::catalog::MigrationCatalog;
use crate::error::MigrateResult;
use crate::registry::TenantRegistry;

/// Fallback estimate when no apply history exists, seconds per table
const DEFAULT_SECS_PER_TABLE: f64 = 2.0;

/// Read-only preview of a migration's effect on one tenant
#[derive(Debug, Clone, Serialize)]
pub struct PreviewResult {
    pub tenant_id: Uuid,
    pub tenant_name: String,
    pub module: String,
    pub migration_name: String,
    /// Forward script rendered against the tenant's schema
    pub script: String,
    pub affected_tables: Vec<String>,
    pub estimated_duration_seconds: u64,
}

#[derive(Default)]
struct TimingInner {
    total_secs: f64,
    total_tables: u64,
}

/// Observed apply durations, aggregated per affected table. The apply
/// engine records timings; previews read them for estimates.
#[derive(Default)]
pub struct TimingHistory {
    inner: RwLock<TimingInner>,
}

impl TimingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful migration's duration
    pub fn record(&self, affected_tables: usize, elapsed: Duration) {
        if affected_tables == 0 {
            return;
        }
        let mut inner = self.inner.write().expect("timing history poisoned");
        inner.total_secs += elapsed.as_secs_f64();
        inner.total_tables += affected_tables as u64;
    }

    /// Average seconds per affected table, `None` with no history
    pub fn secs_per_table(&self) -> Option<f64> {
        let inner = self.inner.read().expect("timing history poisoned");
        (inner.total_tables > 0).then(|| inner.total_secs / inner.total_tables as f64)
    }
}

/// Pure read preview generator: no execution, no locking, no mutation
pub struct PreviewGenerator {
    registry: Arc<dyn TenantRegistry>,
    catalog: Arc<dyn MigrationCatalog>,
    timings: Arc<TimingHistory>,
}

impl PreviewGenerator {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        catalog: Arc<dyn MigrationCatalog>,
        timings: Arc<TimingHistory>,
    ) -> Self {
        Self {
            registry,
            catalog,
            timings,
        }
    }

    pub async fn preview(
        &self,
        tenant_id: Uuid,
        module: &str,
        migration_name: &str,
    ) -> MigrateResult<PreviewResult> {
        let tenant = self.registry.tenant(tenant_id).await?;
        let descriptor = self.catalog.descriptor(module, migration_name).await?;
        let script = self
            .catalog
            .forward_script(module, migration_name, &tenant.schema())
            .await?;

        let secs_per_table = self
            .timings
            .secs_per_table()
            .unwrap_or(DEFAULT_SECS_PER_TABLE);
        let estimated = (descriptor.affected_tables.len() as f64 * secs_per_table).ceil() as u64;

        Ok(PreviewResult {
            tenant_id: tenant.id,
            tenant_name: tenant.name,
            module: descriptor.module,
            migration_name: descriptor.name,
            script,
            affected_tables: descriptor.affected_tables,
            estimated_duration_seconds: estimated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_yields_no_average() {
        let timings = TimingHistory::new();
        assert!(timings.secs_per_table().is_none());
    }

    #[test]
    fn average_tracks_recorded_timings() {
        let timings = TimingHistory::new();
        timings.record(2, Duration::from_secs(10));
        timings.record(3, Duration::from_secs(5));
        let avg = timings.secs_per_table().unwrap();
        assert!((avg - 3.0).abs() < 1e-9);
    }

    #[test]
    fn zero_table_migrations_are_ignored() {
        let timings = TimingHistory::new();
        timings.record(0, Duration::from_secs(100));
        assert!(timings.secs_per_table().is_none());
    }
}
