//! Process-wide migration settings: a single atomically-replaceable
//! record read by the apply engine and scheduler on each operation.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{MigrateError, MigrateResult};

/// Lower bound for the per-migration timeout, seconds
pub const MIN_TIMEOUT_SECS: u64 = 30;
/// Upper bound for the per-migration timeout, seconds
pub const MAX_TIMEOUT_SECS: u64 = 3600;

/// Migration system configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Apply pending migrations automatically when a tenant is provisioned
    pub auto_apply_migrations: bool,
    /// Invoke the backup hook before the first migration of a batch
    pub backup_before_migration: bool,
    /// Whether the scheduler sweep loop runs at all
    pub enable_scheduled_migrations: bool,
    /// Per-migration transaction timeout
    pub migration_timeout_seconds: u64,
    pub notify_on_migration_complete: bool,
    pub notify_on_migration_failure: bool,
    pub notification_emails: Vec<String>,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            auto_apply_migrations: false,
            backup_before_migration: true,
            enable_scheduled_migrations: false,
            migration_timeout_seconds: 300,
            notify_on_migration_complete: true,
            notify_on_migration_failure: true,
            notification_emails: Vec::new(),
        }
    }
}

impl MigrationSettings {
    /// Validate option ranges before the record is accepted
    pub fn validate(&self) -> MigrateResult<()> {
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&self.migration_timeout_seconds) {
            return Err(MigrateError::validation(format!(
                "migration_timeout_seconds must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS}, got {}",
                self.migration_timeout_seconds
            )));
        }
        for email in &self.notification_emails {
            if !email.contains('@') {
                return Err(MigrateError::validation(format!(
                    "invalid notification email: {email}"
                )));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.migration_timeout_seconds)
    }
}

/// Get/update access to the settings record. `update` replaces the whole
/// record so readers never observe a partially-updated value.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self) -> MigrationSettings;

    async fn update(&self, settings: MigrationSettings) -> MigrateResult<()>;
}

/// In-memory settings store
#[derive(Default)]
pub struct MemorySettingsStore {
    current: RwLock<MigrationSettings>,
}

impl MemorySettingsStore {
    pub fn new(settings: MigrationSettings) -> Self {
        Self {
            current: RwLock::new(settings),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get(&self) -> MigrationSettings {
        self.current.read().await.clone()
    }

    async fn update(&self, settings: MigrationSettings) -> MigrateResult<()> {
        settings.validate()?;
        *self.current.write().await = settings;
        Ok(())
    }
}

/// Settings store persisted as a single JSON record. Falls back to
/// defaults when the file is absent or unreadable.
pub struct FileSettingsStore {
    path: PathBuf,
    current: RwLock<MigrationSettings>,
}

impl FileSettingsStore {
    /// Load settings from `path`, defaulting when missing
    pub async fn load(path: impl Into<PathBuf>) -> MigrateResult<Self> {
        let path = path.into();
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<MigrationSettings>(&raw) {
                // A hand-edited file must pass the same validation as an
                // update, or it would drive out-of-range timeouts
                Ok(settings) => match settings.validate() {
                    Ok(()) => settings,
                    Err(e) => {
                        debug!("settings file failed validation, using defaults: {e}");
                        MigrationSettings::default()
                    }
                },
                Err(e) => {
                    debug!("failed to parse settings file, using defaults: {e}");
                    MigrationSettings::default()
                }
            },
            Err(_) => MigrationSettings::default(),
        };
        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn get(&self) -> MigrationSettings {
        self.current.read().await.clone()
    }

    async fn update(&self, settings: MigrationSettings) -> MigrateResult<()> {
        settings.validate()?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(&settings)?;
        tokio::fs::write(&self.path, raw).await?;
        *self.current.write().await = settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_configuration() {
        let settings = MigrationSettings::default();
        assert!(!settings.auto_apply_migrations);
        assert!(settings.backup_before_migration);
        assert!(!settings.enable_scheduled_migrations);
        assert_eq!(settings.migration_timeout_seconds, 300);
    }

    #[test]
    fn timeout_out_of_range_is_rejected() {
        let mut settings = MigrationSettings::default();
        settings.migration_timeout_seconds = 10;
        assert!(settings.validate().is_err());
        settings.migration_timeout_seconds = 7200;
        assert!(settings.validate().is_err());
        settings.migration_timeout_seconds = 30;
        assert!(settings.validate().is_ok());
    }

    #[tokio::test]
    async fn update_replaces_whole_record() {
        let store = MemorySettingsStore::default();
        let mut settings = MigrationSettings::default();
        settings.enable_scheduled_migrations = true;
        settings.notification_emails = vec!["ops@example.com".to_string()];
        store.update(settings.clone()).await.unwrap();
        assert_eq!(store.get().await, settings);
    }

    #[tokio::test]
    async fn invalid_update_leaves_current_record() {
        let store = MemorySettingsStore::default();
        let mut bad = MigrationSettings::default();
        bad.migration_timeout_seconds = 1;
        assert!(store.update(bad).await.is_err());
        assert_eq!(store.get().await, MigrationSettings::default());
    }

    #[tokio::test]
    async fn file_store_round_trips_across_loads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let store = FileSettingsStore::load(&path).await.unwrap();
        let mut settings = MigrationSettings::default();
        settings.auto_apply_migrations = true;
        store.update(settings.clone()).await.unwrap();

        let reloaded = FileSettingsStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get().await, settings);
    }

    #[tokio::test]
    async fn out_of_range_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let mut bad = MigrationSettings::default();
        bad.migration_timeout_seconds = 5;
        tokio::fs::write(&path, serde_json::to_string(&bad).unwrap())
            .await
            .unwrap();

        let store = FileSettingsStore::load(&path).await.unwrap();
        assert_eq!(
            store.get().await.migration_timeout_seconds,
            MigrationSettings::default().migration_timeout_seconds
        );
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let store = FileSettingsStore::load(&path).await.unwrap();
        assert_eq!(store.get().await, MigrationSettings::default());
    }
}
