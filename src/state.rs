//! Per-tenant migration state: the applied-migration ledger that lives
//! inside each tenant's own storage, plus the scoped transaction seam the
//! engines use to execute scripts and mutate the ledger atomically.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{MigrateError, MigrateResult};
use crate::registry::Tenant;

/// One row of a tenant's applied-migration ledger. Append-only per
/// (tenant, module) except for rollback, which removes the latest row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigrationRecord {
    pub tenant_id: Uuid,
    pub module: String,
    pub migration_name: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

/// Opens per-tenant connections to the storage holding each ledger
#[async_trait]
pub trait TenantStateStore: Send + Sync {
    /// Connect to one tenant's storage; `Connectivity` error when
    /// unreachable.
    async fn connect(&self, tenant: &Tenant) -> MigrateResult<Box<dyn TenantConnection>>;
}

/// An open connection to one tenant's storage
#[async_trait]
pub trait TenantConnection: Send + Sync {
    /// Schema identifier scripts are rendered against
    fn schema(&self) -> &str;

    /// Ledger rows for one module, in append order
    async fn applied(&self, module: &str) -> MigrateResult<Vec<AppliedMigrationRecord>>;

    /// Open a scoped transaction covering one migration
    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>>;
}

/// A transaction scoping a single migration: script execution and the
/// matching ledger mutation commit or roll back as one unit.
#[async_trait]
pub trait MigrationTransaction: Send {
    async fn execute_script(&mut self, script: &str) -> MigrateResult<()>;

    async fn record_applied(&mut self, record: AppliedMigrationRecord) -> MigrateResult<()>;

    async fn remove_applied(&mut self, module: &str, migration_name: &str) -> MigrateResult<()>;

    async fn commit(self: Box<Self>) -> MigrateResult<()>;

    async fn rollback(self: Box<Self>) -> MigrateResult<()>;
}

#[derive(Default)]
struct TenantState {
    ledgers: BTreeMap<String, Vec<AppliedMigrationRecord>>,
    executed_scripts: Vec<String>,
    unreachable: bool,
    /// Scripts containing any of these markers fail at execution time
    failing_markers: HashSet<String>,
    /// Scripts containing the marker sleep this long before completing
    script_delays: HashMap<String, Duration>,
}

type SharedStates = Arc<RwLock<HashMap<Uuid, TenantState>>>;

/// In-memory state backend with per-tenant fault injection, used by tests
/// and demos.
#[derive(Default, Clone)]
pub struct MemoryStateBackend {
    states: SharedStates,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a tenant's storage refuse connections
    pub async fn set_unreachable(&self, tenant_id: Uuid, unreachable: bool) {
        let mut states = self.states.write().await;
        states.entry(tenant_id).or_default().unreachable = unreachable;
    }

    /// Fail any script containing `marker` for this tenant
    pub async fn fail_scripts_containing(&self, tenant_id: Uuid, marker: &str) {
        let mut states = self.states.write().await;
        states
            .entry(tenant_id)
            .or_default()
            .failing_markers
            .insert(marker.to_string());
    }

    /// Delay any script containing `marker`, for timeout tests
    pub async fn delay_scripts_containing(&self, tenant_id: Uuid, marker: &str, delay: Duration) {
        let mut states = self.states.write().await;
        states
            .entry(tenant_id)
            .or_default()
            .script_delays
            .insert(marker.to_string(), delay);
    }

    /// Pre-populate a ledger row without executing anything
    pub async fn seed_applied(&self, record: AppliedMigrationRecord) {
        let mut states = self.states.write().await;
        states
            .entry(record.tenant_id)
            .or_default()
            .ledgers
            .entry(record.module.clone())
            .or_default()
            .push(record);
    }

    /// Scripts committed against this tenant, in execution order
    pub async fn executed_scripts(&self, tenant_id: Uuid) -> Vec<String> {
        let states = self.states.read().await;
        states
            .get(&tenant_id)
            .map(|s| s.executed_scripts.clone())
            .unwrap_or_default()
    }

    /// Ledger rows for one tenant and module
    pub async fn ledger(&self, tenant_id: Uuid, module: &str) -> Vec<AppliedMigrationRecord> {
        let states = self.states.read().await;
        states
            .get(&tenant_id)
            .and_then(|s| s.ledgers.get(module))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TenantStateStore for MemoryStateBackend {
    async fn connect(&self, tenant: &Tenant) -> MigrateResult<Box<dyn TenantConnection>> {
        let states = self.states.read().await;
        if states.get(&tenant.id).is_some_and(|s| s.unreachable) {
            return Err(MigrateError::connectivity(format!(
                "connection refused for tenant {} ({})",
                tenant.code, tenant.connection
            )));
        }
        drop(states);
        Ok(Box::new(MemoryConnection {
            tenant_id: tenant.id,
            schema: tenant.schema(),
            states: self.states.clone(),
        }))
    }
}

struct MemoryConnection {
    tenant_id: Uuid,
    schema: String,
    states: SharedStates,
}

#[async_trait]
impl TenantConnection for MemoryConnection {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn applied(&self, module: &str) -> MigrateResult<Vec<AppliedMigrationRecord>> {
        let states = self.states.read().await;
        Ok(states
            .get(&self.tenant_id)
            .and_then(|s| s.ledgers.get(module))
            .cloned()
            .unwrap_or_default())
    }

    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tenant_id: self.tenant_id,
            states: self.states.clone(),
            executed: Vec::new(),
            staged: Vec::new(),
        }))
    }
}

enum StagedOp {
    Record(AppliedMigrationRecord),
    Remove { module: String, name: String },
}

struct MemoryTransaction {
    tenant_id: Uuid,
    states: SharedStates,
    executed: Vec<String>,
    staged: Vec<StagedOp>,
}

#[async_trait]
impl MigrationTransaction for MemoryTransaction {
    async fn execute_script(&mut self, script: &str) -> MigrateResult<()> {
        let (delay, failing) = {
            let states = self.states.read().await;
            let state = states.get(&self.tenant_id);
            let delay = state.and_then(|s| {
                s.script_delays
                    .iter()
                    .find(|(marker, _)| script.contains(marker.as_str()))
                    .map(|(_, d)| *d)
            });
            let failing = state.is_some_and(|s| {
                s.failing_markers.iter().any(|m| script.contains(m.as_str()))
            });
            (delay, failing)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(MigrateError::storage(format!(
                "script execution failed: {}",
                script.lines().next().unwrap_or_default()
            )));
        }
        self.executed.push(script.to_string());
        Ok(())
    }

    async fn record_applied(&mut self, record: AppliedMigrationRecord) -> MigrateResult<()> {
        self.staged.push(StagedOp::Record(record));
        Ok(())
    }

    async fn remove_applied(&mut self, module: &str, migration_name: &str) -> MigrateResult<()> {
        self.staged.push(StagedOp::Remove {
            module: module.to_string(),
            name: migration_name.to_string(),
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        let mut states = self.states.write().await;
        let state = states.entry(self.tenant_id).or_default();
        state.executed_scripts.extend(self.executed);
        for op in self.staged {
            match op {
                StagedOp::Record(record) => {
                    state
                        .ledgers
                        .entry(record.module.clone())
                        .or_default()
                        .push(record);
                }
                StagedOp::Remove { module, name } => {
                    if let Some(ledger) = state.ledgers.get_mut(&module) {
                        ledger.retain(|r| r.migration_name != name);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        // Staged operations are simply dropped
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    ledgers: BTreeMap<String, Vec<AppliedMigrationRecord>>,
}

/// State backend persisting each tenant's ledger as a JSON file under a
/// base directory. Script execution is delegated to the tenant's actual
/// database in production deployments; this backend only keeps the ledger
/// durable, which is what the orchestration engine needs.
pub struct FileStateBackend {
    base_path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileStateBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn ledger_path(&self, tenant_id: Uuid) -> PathBuf {
        self.base_path.join(format!("{tenant_id}.json"))
    }

    async fn load(&self, tenant_id: Uuid) -> MigrateResult<LedgerFile> {
        let path = self.ledger_path(tenant_id);
        if !path.exists() {
            return Ok(LedgerFile::default());
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl TenantStateStore for FileStateBackend {
    async fn connect(&self, tenant: &Tenant) -> MigrateResult<Box<dyn TenantConnection>> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        Ok(Box::new(FileConnection {
            tenant_id: tenant.id,
            schema: tenant.schema(),
            backend: FileStateBackend {
                base_path: self.base_path.clone(),
                write_lock: self.write_lock.clone(),
            },
        }))
    }
}

struct FileConnection {
    tenant_id: Uuid,
    schema: String,
    backend: FileStateBackend,
}

#[async_trait]
impl TenantConnection for FileConnection {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn applied(&self, module: &str) -> MigrateResult<Vec<AppliedMigrationRecord>> {
        let file = self.backend.load(self.tenant_id).await?;
        Ok(file.ledgers.get(module).cloned().unwrap_or_default())
    }

    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>> {
        Ok(Box::new(FileTransaction {
            tenant_id: self.tenant_id,
            backend: FileStateBackend {
                base_path: self.backend.base_path.clone(),
                write_lock: self.backend.write_lock.clone(),
            },
            staged: Vec::new(),
        }))
    }
}

struct FileTransaction {
    tenant_id: Uuid,
    backend: FileStateBackend,
    staged: Vec<StagedOp>,
}

#[async_trait]
impl MigrationTransaction for FileTransaction {
    async fn execute_script(&mut self, _script: &str) -> MigrateResult<()> {
        // The tenant's own database runs the script; the ledger file is
        // the durable state this backend owns.
        Ok(())
    }

    async fn record_applied(&mut self, record: AppliedMigrationRecord) -> MigrateResult<()> {
        self.staged.push(StagedOp::Record(record));
        Ok(())
    }

    async fn remove_applied(&mut self, module: &str, migration_name: &str) -> MigrateResult<()> {
        self.staged.push(StagedOp::Remove {
            module: module.to_string(),
            name: migration_name.to_string(),
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        let _guard = self.backend.write_lock.lock().await;
        let mut file = self.backend.load(self.tenant_id).await?;
        for op in self.staged {
            match op {
                StagedOp::Record(record) => {
                    file.ledgers
                        .entry(record.module.clone())
                        .or_default()
                        .push(record);
                }
                StagedOp::Remove { module, name } => {
                    if let Some(ledger) = file.ledgers.get_mut(&module) {
                        ledger.retain(|r| r.migration_name != name);
                    }
                }
            }
        }
        let path = self.backend.ledger_path(self.tenant_id);
        let raw = serde_json::to_string_pretty(&file)?;
        tokio::fs::write(&path, raw).await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        Ok(())
    }
}
