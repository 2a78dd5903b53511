//! Tenant registry: enumerates the tenants whose databases the engine
//! orchestrates, with their connection handles.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{MigrateError, MigrateResult};

/// A tenant as known to the platform's master records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    /// Short unique code, also the basis of the tenant's schema identifier
    pub code: String,
    /// Opaque connection handle for the tenant's own storage
    pub connection: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Tenant {
    /// Schema identifier used when rendering migration scripts
    pub fn schema(&self) -> String {
        format!("tenant_{}", self.code.to_lowercase())
    }
}

/// Source of tenants and their connection handles
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// All active tenants, in stable order
    async fn active_tenants(&self) -> MigrateResult<Vec<Tenant>>;

    /// Look up one active tenant; `NotFound` if unknown or inactive
    async fn tenant(&self, id: Uuid) -> MigrateResult<Tenant>;
}

/// In-memory registry, loadable from a JSON tenant list
#[derive(Default)]
pub struct StaticRegistry {
    tenants: RwLock<Vec<Tenant>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a tenant list from a JSON file
    pub async fn from_path(path: &Path) -> MigrateResult<Arc<Self>> {
        let raw = tokio::fs::read_to_string(path).await?;
        let tenants: Vec<Tenant> = serde_json::from_str(&raw)?;
        let registry = Self::new();
        *registry.tenants.write().await = tenants;
        Ok(Arc::new(registry))
    }

    pub async fn add(&self, tenant: Tenant) {
        self.tenants.write().await.push(tenant);
    }
}

#[async_trait]
impl TenantRegistry for StaticRegistry {
    async fn active_tenants(&self) -> MigrateResult<Vec<Tenant>> {
        Ok(self
            .tenants
            .read()
            .await
            .iter()
            .filter(|t| t.active)
            .cloned()
            .collect())
    }

    async fn tenant(&self, id: Uuid) -> MigrateResult<Tenant> {
        self.tenants
            .read()
            .await
            .iter()
            .find(|t| t.id == id && t.active)
            .cloned()
            .ok_or_else(|| MigrateError::not_found(format!("tenant {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inactive_tenants_are_hidden() {
        let registry = StaticRegistry::new();
        let active = Tenant {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            code: "ACME".to_string(),
            connection: "db://acme".to_string(),
            active: true,
        };
        let inactive = Tenant {
            id: Uuid::new_v4(),
            name: "Gone".to_string(),
            code: "GONE".to_string(),
            connection: "db://gone".to_string(),
            active: false,
        };
        registry.add(active.clone()).await;
        registry.add(inactive.clone()).await;

        let listed = registry.active_tenants().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);

        assert!(matches!(
            registry.tenant(inactive.id).await,
            Err(MigrateError::NotFound(_))
        ));
    }

    #[test]
    fn schema_identifier_uses_lowercased_code() {
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            code: "ACME".to_string(),
            connection: String::new(),
            active: true,
        };
        assert_eq!(tenant.schema(), "tenant_acme");
    }
}
