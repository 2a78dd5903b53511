//! Test fixtures: a canned catalog, registry, and state backend wired
//! into a [`MigrationService`], plus recording hook implementations.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::apply::ApplyResult;
use crate::catalog::{MigrationDefinition, StaticCatalog, SCHEMA_PLACEHOLDER};
use crate::error::MigrateResult;
use crate::hooks::{BackupHook, NotificationHook};
use crate::registry::{StaticRegistry, Tenant};
use crate::service::{MigrationService, MigrationServiceBuilder};
use crate::state::MemoryStateBackend;

/// A migration definition whose scripts mention the migration name, so
/// fault injection by marker and executed-script assertions stay simple.
pub fn definition(module: &str, name: &str, reversible: bool) -> MigrationDefinition {
    MigrationDefinition {
        module: module.to_string(),
        name: name.to_string(),
        affected_tables: vec![format!("{}_{}", module.to_lowercase(), name.to_lowercase())],
        forward: format!("-- {name}\nCREATE TABLE {SCHEMA_PLACEHOLDER}.{name} ()"),
        backward: reversible.then(|| format!("-- undo {name}\nDROP TABLE {SCHEMA_PLACEHOLDER}.{name}")),
        checksum: None,
    }
}

pub fn tenant(name: &str, code: &str) -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: name.to_string(),
        code: code.to_string(),
        connection: format!("db://{}", code.to_lowercase()),
        active: true,
    }
}

/// Everything a test needs to drive the orchestrator
pub struct TestHarness {
    pub registry: Arc<StaticRegistry>,
    pub catalog: Arc<StaticCatalog>,
    pub state: Arc<MemoryStateBackend>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(StaticRegistry::new()),
            catalog: Arc::new(StaticCatalog::new()),
            state: Arc::new(MemoryStateBackend::new()),
        }
    }

    /// Register a CRM catalog of [m1, m2, m3], all reversible
    pub async fn with_crm_catalog(self) -> Self {
        for name in ["m1", "m2", "m3"] {
            self.catalog.register(definition("CRM", name, true)).await;
        }
        self
    }

    pub async fn add_tenant(&self, name: &str, code: &str) -> Tenant {
        let t = tenant(name, code);
        self.registry.add(t.clone()).await;
        t
    }

    pub fn service_builder(&self) -> MigrationServiceBuilder {
        MigrationService::builder(
            self.registry.clone(),
            self.catalog.clone(),
            self.state.clone(),
        )
    }

    pub fn service(&self) -> MigrationService {
        self.service_builder().build()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Backup hook recording which tenants were backed up
#[derive(Default)]
pub struct RecordingBackupHook {
    pub backed_up: Mutex<Vec<Uuid>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl BackupHook for RecordingBackupHook {
    async fn backup(&self, tenant: &Tenant) -> MigrateResult<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::error::MigrateError::storage("backup target unavailable"));
        }
        self.backed_up.lock().await.push(tenant.id);
        Ok(())
    }
}

/// Notification hook recording every delivered outcome
#[derive(Default)]
pub struct RecordingNotificationHook {
    pub completed: Mutex<Vec<ApplyResult>>,
    pub failed: Mutex<Vec<ApplyResult>>,
}

#[async_trait]
impl NotificationHook for RecordingNotificationHook {
    async fn migration_completed(&self, result: &ApplyResult, _recipients: &[String]) {
        self.completed.lock().await.push(result.clone());
    }

    async fn migration_failed(&self, result: &ApplyResult, _recipients: &[String]) {
        self.failed.lock().await.push(result.clone());
    }
}
