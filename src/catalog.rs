//! Migration catalog: the ordered, per-module list of schema changes
//! every tenant is expected to converge on.
//!
//! The catalog is an external collaborator behind the [`MigrationCatalog`]
//! trait. [`StaticCatalog`] is the bundled implementation, loadable from a
//! JSON definition file, used by the CLI and by tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{MigrateError, MigrateResult};

/// Placeholder in catalog scripts replaced with the tenant schema identifier
pub const SCHEMA_PLACEHOLDER: &str = "{schema}";

/// Immutable description of one migration within a module's ordered catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDescriptor {
    /// Business module the migration belongs to (CRM, Inventory, ...)
    pub module: String,
    /// Unique migration name within the module
    pub name: String,
    /// Canonical application order within the module
    pub sequence_index: u32,
    /// Checksum of the forward script
    pub checksum: String,
    /// Tables the migration touches, as declared by its author
    pub affected_tables: Vec<String>,
    /// Whether a backward script exists for rollback
    pub has_backward_script: bool,
}

/// Ordered migration descriptors and script rendering, per module.
///
/// Read-only and safe to share across all concurrent operations.
#[async_trait]
pub trait MigrationCatalog: Send + Sync {
    /// All modules known to the catalog, in stable order
    async fn modules(&self) -> MigrateResult<Vec<String>>;

    /// Descriptors for a module, ordered by `sequence_index`
    async fn descriptors(&self, module: &str) -> MigrateResult<Vec<MigrationDescriptor>>;

    /// Resolve a single descriptor; `Validation` error if unknown
    async fn descriptor(&self, module: &str, name: &str) -> MigrateResult<MigrationDescriptor>;

    /// Render the forward script parameterized with the tenant schema
    async fn forward_script(
        &self,
        module: &str,
        name: &str,
        schema: &str,
    ) -> MigrateResult<String>;

    /// Render the backward script, or `None` when the migration has none
    async fn backward_script(
        &self,
        module: &str,
        name: &str,
        schema: &str,
    ) -> MigrateResult<Option<String>>;
}

/// One migration definition as authored in a catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDefinition {
    pub module: String,
    pub name: String,
    #[serde(default)]
    pub affected_tables: Vec<String>,
    pub forward: String,
    #[serde(default)]
    pub backward: Option<String>,
    /// Computed from the forward script when absent
    #[serde(default)]
    pub checksum: Option<String>,
}

struct CatalogEntry {
    descriptor: MigrationDescriptor,
    forward: String,
    backward: Option<String>,
}

/// In-memory catalog keyed by module, preserving insertion order as the
/// canonical sequence.
#[derive(Default)]
pub struct StaticCatalog {
    modules: RwLock<BTreeMap<String, Vec<CatalogEntry>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load catalog definitions from a JSON file
    pub async fn from_path(path: &Path) -> MigrateResult<Arc<Self>> {
        let raw = tokio::fs::read_to_string(path).await?;
        let definitions: Vec<MigrationDefinition> = serde_json::from_str(&raw)?;
        let catalog = Arc::new(Self::new());
        for definition in definitions {
            catalog.register(definition).await;
        }
        Ok(catalog)
    }

    /// Register a migration at the end of its module's sequence
    pub async fn register(&self, definition: MigrationDefinition) -> MigrationDescriptor {
        let mut modules = self.modules.write().await;
        let entries = modules.entry(definition.module.clone()).or_default();
        let checksum = definition
            .checksum
            .unwrap_or_else(|| script_checksum(&definition.forward));
        let descriptor = MigrationDescriptor {
            module: definition.module,
            name: definition.name,
            sequence_index: entries.len() as u32,
            checksum,
            affected_tables: definition.affected_tables,
            has_backward_script: definition.backward.is_some(),
        };
        entries.push(CatalogEntry {
            descriptor: descriptor.clone(),
            forward: definition.forward,
            backward: definition.backward,
        });
        descriptor
    }

    async fn entry<T>(
        &self,
        module: &str,
        name: &str,
        map: impl FnOnce(&CatalogEntry) -> T,
    ) -> MigrateResult<T> {
        let modules = self.modules.read().await;
        let entries = modules
            .get(module)
            .ok_or_else(|| MigrateError::validation(format!("unknown module: {module}")))?;
        entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(map)
            .ok_or_else(|| {
                MigrateError::validation(format!("unknown migration {name} in module {module}"))
            })
    }
}

#[async_trait]
impl MigrationCatalog for StaticCatalog {
    async fn modules(&self) -> MigrateResult<Vec<String>> {
        Ok(self.modules.read().await.keys().cloned().collect())
    }

    async fn descriptors(&self, module: &str) -> MigrateResult<Vec<MigrationDescriptor>> {
        let modules = self.modules.read().await;
        let entries = modules
            .get(module)
            .ok_or_else(|| MigrateError::validation(format!("unknown module: {module}")))?;
        Ok(entries.iter().map(|e| e.descriptor.clone()).collect())
    }

    async fn descriptor(&self, module: &str, name: &str) -> MigrateResult<MigrationDescriptor> {
        self.entry(module, name, |e| e.descriptor.clone()).await
    }

    async fn forward_script(
        &self,
        module: &str,
        name: &str,
        schema: &str,
    ) -> MigrateResult<String> {
        let template = self.entry(module, name, |e| e.forward.clone()).await?;
        Ok(render_script(&template, schema))
    }

    async fn backward_script(
        &self,
        module: &str,
        name: &str,
        schema: &str,
    ) -> MigrateResult<Option<String>> {
        let template = self.entry(module, name, |e| e.backward.clone()).await?;
        Ok(template.map(|t| render_script(&t, schema)))
    }
}

fn render_script(template: &str, schema: &str) -> String {
    template.replace(SCHEMA_PLACEHOLDER, schema)
}

fn script_checksum(script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    format!("{:x}", hasher.finalize())
}
