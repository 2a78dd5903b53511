//! Status aggregation: diffs each tenant's applied-migration ledger
//! against the catalog to compute pending and applied sets.
//!
//! The scan fans out across tenants with bounded concurrency and a
//! per-probe timeout; a single tenant fault is captured into that
//! tenant's status and never aborts the aggregate.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::{MigrationCatalog, MigrationDescriptor};
use crate::error::MigrateResult;
use crate::registry::{Tenant, TenantRegistry};
use crate::state::{AppliedMigrationRecord, TenantStateStore};

const DEFAULT_PROBE_LIMIT: usize = 8;
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Derived, never-persisted migration status for one tenant
#[derive(Debug, Clone, Serialize)]
pub struct TenantMigrationStatus {
    pub tenant_id: Uuid,
    pub tenant_name: String,
    pub tenant_code: String,
    /// Catalog-ordered pending migration names per module
    pub pending_by_module: BTreeMap<String, Vec<String>>,
    /// Catalog-ordered applied migration names per module
    pub applied_by_module: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TenantMigrationStatus {
    fn faulted(tenant: &Tenant, error: String) -> Self {
        Self {
            tenant_id: tenant.id,
            tenant_name: tenant.name.clone(),
            tenant_code: tenant.code.clone(),
            pending_by_module: BTreeMap::new(),
            applied_by_module: BTreeMap::new(),
            error: Some(error),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending_by_module.values().any(|m| !m.is_empty())
    }

    pub fn total_pending(&self) -> usize {
        self.pending_by_module.values().map(Vec::len).sum()
    }
}

/// Catalog-order diff of one module's descriptors against a ledger.
///
/// Pending preserves catalog order; applied is the catalog-ordered subset
/// present in the ledger. Together they always partition the catalog.
pub(crate) fn diff_module(
    descriptors: &[MigrationDescriptor],
    ledger: &[AppliedMigrationRecord],
) -> (Vec<MigrationDescriptor>, Vec<String>) {
    let applied_names: HashSet<&str> =
        ledger.iter().map(|r| r.migration_name.as_str()).collect();
    let mut pending = Vec::new();
    let mut applied = Vec::new();
    for descriptor in descriptors {
        if applied_names.contains(descriptor.name.as_str()) {
            applied.push(descriptor.name.clone());
        } else {
            pending.push(descriptor.clone());
        }
    }
    (pending, applied)
}

/// Read-only aggregator over registry + catalog + per-tenant state
pub struct StatusAggregator {
    registry: Arc<dyn TenantRegistry>,
    catalog: Arc<dyn MigrationCatalog>,
    state: Arc<dyn TenantStateStore>,
    probe_limit: usize,
    probe_timeout: Duration,
}

impl StatusAggregator {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        catalog: Arc<dyn MigrationCatalog>,
        state: Arc<dyn TenantStateStore>,
    ) -> Self {
        Self {
            registry,
            catalog,
            state,
            probe_limit: DEFAULT_PROBE_LIMIT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Bound the number of tenants probed concurrently
    pub fn with_probe_limit(mut self, limit: usize) -> Self {
        self.probe_limit = limit.max(1);
        self
    }

    /// Bound the time spent probing a single tenant
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Compute fresh per-tenant status for every active tenant
    pub async fn pending_migrations(&self) -> MigrateResult<Vec<TenantMigrationStatus>> {
        let tenants = self.registry.active_tenants().await?;
        debug!(tenants = tenants.len(), "scanning tenant migration status");

        let mut statuses: Vec<TenantMigrationStatus> = stream::iter(
            tenants.into_iter().map(|tenant| self.probe(tenant)),
        )
        .buffer_unordered(self.probe_limit)
        .collect()
        .await;

        // buffer_unordered yields in completion order; report stably
        statuses.sort_by(|a, b| a.tenant_name.cmp(&b.tenant_name));
        Ok(statuses)
    }

    /// Status for a single tenant; faults are captured, not raised
    pub async fn tenant_status(&self, tenant: &Tenant) -> TenantMigrationStatus {
        self.probe(tenant.clone()).await
    }

    async fn probe(&self, tenant: Tenant) -> TenantMigrationStatus {
        match timeout(self.probe_timeout, self.diff_tenant(&tenant)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(tenant_id = %tenant.id, error = %e, "tenant status probe failed");
                TenantMigrationStatus::faulted(&tenant, e.to_string())
            }
            Err(_) => {
                warn!(tenant_id = %tenant.id, "tenant status probe timed out");
                TenantMigrationStatus::faulted(
                    &tenant,
                    format!("status probe timed out after {:?}", self.probe_timeout),
                )
            }
        }
    }

    async fn diff_tenant(&self, tenant: &Tenant) -> MigrateResult<TenantMigrationStatus> {
        let conn = self.state.connect(tenant).await?;
        let mut pending_by_module = BTreeMap::new();
        let mut applied_by_module = BTreeMap::new();

        for module in self.catalog.modules().await? {
            let descriptors = self.catalog.descriptors(&module).await?;
            let ledger = conn.applied(&module).await?;
            let (pending, applied) = diff_module(&descriptors, &ledger);
            pending_by_module.insert(
                module.clone(),
                pending.into_iter().map(|d| d.name).collect(),
            );
            applied_by_module.insert(module, applied);
        }

        Ok(TenantMigrationStatus {
            tenant_id: tenant.id,
            tenant_name: tenant.name.clone(),
            tenant_code: tenant.code.clone(),
            pending_by_module,
            applied_by_module,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn descriptor(module: &str, name: &str, index: u32) -> MigrationDescriptor {
        MigrationDescriptor {
            module: module.to_string(),
            name: name.to_string(),
            sequence_index: index,
            checksum: String::new(),
            affected_tables: Vec::new(),
            has_backward_script: false,
        }
    }

    fn ledger_row(name: &str) -> AppliedMigrationRecord {
        AppliedMigrationRecord {
            tenant_id: Uuid::new_v4(),
            module: "CRM".to_string(),
            migration_name: name.to_string(),
            applied_at: Utc::now(),
            checksum: String::new(),
        }
    }

    #[test]
    fn diff_partitions_catalog_in_order() {
        let catalog = vec![
            descriptor("CRM", "m1", 0),
            descriptor("CRM", "m2", 1),
            descriptor("CRM", "m3", 2),
        ];
        let ledger = vec![ledger_row("m1")];

        let (pending, applied) = diff_module(&catalog, &ledger);
        assert_eq!(
            pending.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["m2", "m3"]
        );
        assert_eq!(applied, vec!["m1"]);
    }

    #[test]
    fn diff_orders_applied_by_catalog_not_ledger() {
        let catalog = vec![descriptor("CRM", "m1", 0), descriptor("CRM", "m2", 1)];
        // Ledger rows recorded out of order still report in catalog order
        let ledger = vec![ledger_row("m2"), ledger_row("m1")];

        let (pending, applied) = diff_module(&catalog, &ledger);
        assert!(pending.is_empty());
        assert_eq!(applied, vec!["m1", "m2"]);
    }

    #[test]
    fn gap_in_ledger_keeps_predecessor_pending_first() {
        let catalog = vec![
            descriptor("CRM", "m1", 0),
            descriptor("CRM", "m2", 1),
            descriptor("CRM", "m3", 2),
        ];
        let ledger = vec![ledger_row("m2")];

        let (pending, _) = diff_module(&catalog, &ledger);
        assert_eq!(
            pending.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m3"]
        );
    }
}
