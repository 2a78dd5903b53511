//! Deferred migration scheduling: a durable job queue swept by a
//! periodic background task.
//!
//! Job lifecycle: Pending -> Running -> Completed | Failed, with
//! Cancelled reachable only from Pending. A sweep claims each due job
//! through a conditional state transition, so a job executes at most
//! once even with concurrent sweeps. Running jobs whose claim has gone
//! stale (crashed process) are reset to Pending and re-claimed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::apply::ApplyEngine;
use crate::error::{MigrateError, MigrateResult};
use crate::registry::TenantRegistry;
use crate::settings::SettingsStore;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Running jobs older than this are treated as abandoned by a crashed
/// process and become re-claimable.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Lifecycle state of a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One durable deferred-apply job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMigrationJob {
    pub schedule_id: Uuid,
    pub tenant_id: Uuid,
    /// Absent means "apply all pending for this tenant"
    #[serde(default)]
    pub module: Option<String>,
    /// With `module`, apply pending up to and including this migration
    #[serde(default)]
    pub migration_name: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub status: JobStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Durable queue of scheduled jobs. Must survive process restarts.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: ScheduledMigrationJob) -> MigrateResult<()>;

    async fn get(&self, schedule_id: Uuid) -> MigrateResult<Option<ScheduledMigrationJob>>;

    /// Pending and Running jobs, ordered by scheduled time
    async fn list_open(&self) -> MigrateResult<Vec<ScheduledMigrationJob>>;

    /// Pending jobs whose scheduled time has passed, ordered by it
    async fn due(&self, now: DateTime<Utc>) -> MigrateResult<Vec<ScheduledMigrationJob>>;

    /// Conditionally transition Pending -> Running. Returns false when
    /// another worker already claimed the job (single-flight).
    async fn claim(&self, schedule_id: Uuid) -> MigrateResult<bool>;

    /// Reset Running jobs started before `cutoff` back to Pending;
    /// returns how many were reclaimed.
    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> MigrateResult<usize>;

    /// Terminal transition from Running to Completed or Failed
    async fn complete(&self, schedule_id: Uuid, error: Option<String>) -> MigrateResult<()>;

    /// Transition Pending -> Cancelled; rejected in any other state
    async fn cancel(&self, schedule_id: Uuid) -> MigrateResult<()>;
}

fn apply_claim(job: &mut ScheduledMigrationJob) -> bool {
    if job.status != JobStatus::Pending {
        return false;
    }
    job.status = JobStatus::Running;
    job.started_at = Some(Utc::now());
    true
}

fn apply_cancel(job: &mut ScheduledMigrationJob) -> MigrateResult<()> {
    if job.status != JobStatus::Pending {
        return Err(MigrateError::validation(format!(
            "cannot cancel job {} in status {:?}",
            job.schedule_id, job.status
        )));
    }
    job.status = JobStatus::Cancelled;
    Ok(())
}

fn apply_complete(job: &mut ScheduledMigrationJob, error: Option<String>) {
    job.status = if error.is_some() {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    };
    job.executed_at = Some(Utc::now());
    job.error = error;
}

fn open_jobs(jobs: &HashMap<Uuid, ScheduledMigrationJob>) -> Vec<ScheduledMigrationJob> {
    let mut open: Vec<_> = jobs
        .values()
        .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
        .cloned()
        .collect();
    open.sort_by_key(|j| j.scheduled_time);
    open
}

fn due_jobs(
    jobs: &HashMap<Uuid, ScheduledMigrationJob>,
    now: DateTime<Utc>,
) -> Vec<ScheduledMigrationJob> {
    let mut due: Vec<_> = jobs
        .values()
        .filter(|j| j.status == JobStatus::Pending && j.scheduled_time <= now)
        .cloned()
        .collect();
    due.sort_by_key(|j| j.scheduled_time);
    due
}

fn reclaim(jobs: &mut HashMap<Uuid, ScheduledMigrationJob>, cutoff: DateTime<Utc>) -> usize {
    let mut reclaimed = 0;
    for job in jobs.values_mut() {
        if job.status == JobStatus::Running && job.started_at.is_some_and(|t| t < cutoff) {
            warn!(schedule_id = %job.schedule_id, "reclaiming stale running job");
            job.status = JobStatus::Pending;
            job.started_at = None;
            reclaimed += 1;
        }
    }
    reclaimed
}

/// In-memory job store for tests and demos
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, ScheduledMigrationJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: ScheduledMigrationJob) -> MigrateResult<()> {
        self.jobs.write().await.insert(job.schedule_id, job);
        Ok(())
    }

    async fn get(&self, schedule_id: Uuid) -> MigrateResult<Option<ScheduledMigrationJob>> {
        Ok(self.jobs.read().await.get(&schedule_id).cloned())
    }

    async fn list_open(&self) -> MigrateResult<Vec<ScheduledMigrationJob>> {
        Ok(open_jobs(&*self.jobs.read().await))
    }

    async fn due(&self, now: DateTime<Utc>) -> MigrateResult<Vec<ScheduledMigrationJob>> {
        Ok(due_jobs(&*self.jobs.read().await, now))
    }

    async fn claim(&self, schedule_id: Uuid) -> MigrateResult<bool> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&schedule_id)
            .ok_or_else(|| MigrateError::not_found(format!("scheduled job {schedule_id}")))?;
        Ok(apply_claim(job))
    }

    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> MigrateResult<usize> {
        Ok(reclaim(&mut *self.jobs.write().await, cutoff))
    }

    async fn complete(&self, schedule_id: Uuid, error: Option<String>) -> MigrateResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&schedule_id)
            .ok_or_else(|| MigrateError::not_found(format!("scheduled job {schedule_id}")))?;
        apply_complete(job, error);
        Ok(())
    }

    async fn cancel(&self, schedule_id: Uuid) -> MigrateResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&schedule_id)
            .ok_or_else(|| MigrateError::not_found(format!("scheduled job {schedule_id}")))?;
        apply_cancel(job)
    }
}

/// Job store persisted as a single JSON file, loaded at startup so jobs
/// survive restarts.
pub struct FileJobStore {
    path: PathBuf,
    jobs: RwLock<HashMap<Uuid, ScheduledMigrationJob>>,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub async fn load(path: impl Into<PathBuf>) -> MigrateResult<Self> {
        let path = path.into();
        let jobs = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let list: Vec<ScheduledMigrationJob> = serde_json::from_str(&raw)?;
                list.into_iter().map(|j| (j.schedule_id, j)).collect()
            }
            // A queue that never existed starts empty; any other read
            // failure must not be mistaken for one, or the next persist
            // would wipe the durable queue.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            jobs: RwLock::new(jobs),
            write_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> MigrateResult<()> {
        let _guard = self.write_lock.lock().await;
        let jobs = self.jobs.read().await;
        let mut list: Vec<_> = jobs.values().cloned().collect();
        list.sort_by_key(|j| j.created_at);
        drop(jobs);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(&list)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn insert(&self, job: ScheduledMigrationJob) -> MigrateResult<()> {
        self.jobs.write().await.insert(job.schedule_id, job);
        self.persist().await
    }

    async fn get(&self, schedule_id: Uuid) -> MigrateResult<Option<ScheduledMigrationJob>> {
        Ok(self.jobs.read().await.get(&schedule_id).cloned())
    }

    async fn list_open(&self) -> MigrateResult<Vec<ScheduledMigrationJob>> {
        Ok(open_jobs(&*self.jobs.read().await))
    }

    async fn due(&self, now: DateTime<Utc>) -> MigrateResult<Vec<ScheduledMigrationJob>> {
        Ok(due_jobs(&*self.jobs.read().await, now))
    }

    async fn claim(&self, schedule_id: Uuid) -> MigrateResult<bool> {
        let claimed = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(&schedule_id)
                .ok_or_else(|| MigrateError::not_found(format!("scheduled job {schedule_id}")))?;
            apply_claim(job)
        };
        if claimed {
            self.persist().await?;
        }
        Ok(claimed)
    }

    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> MigrateResult<usize> {
        let reclaimed = reclaim(&mut *self.jobs.write().await, cutoff);
        if reclaimed > 0 {
            self.persist().await?;
        }
        Ok(reclaimed)
    }

    async fn complete(&self, schedule_id: Uuid, error: Option<String>) -> MigrateResult<()> {
        {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(&schedule_id)
                .ok_or_else(|| MigrateError::not_found(format!("scheduled job {schedule_id}")))?;
            apply_complete(job, error);
        }
        self.persist().await
    }

    async fn cancel(&self, schedule_id: Uuid) -> MigrateResult<()> {
        {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(&schedule_id)
                .ok_or_else(|| MigrateError::not_found(format!("scheduled job {schedule_id}")))?;
            apply_cancel(job)?;
        }
        self.persist().await
    }
}

/// Creates, cancels, and sweeps scheduled migration jobs
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    engine: Arc<ApplyEngine>,
    registry: Arc<dyn TenantRegistry>,
    settings: Arc<dyn SettingsStore>,
    sweep_interval: Duration,
    stale_after: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<ApplyEngine>,
        registry: Arc<dyn TenantRegistry>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            settings,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Create a Pending job. The tenant lock is not taken here; conflicts
    /// surface at execution time.
    pub async fn schedule(
        &self,
        tenant_id: Uuid,
        scheduled_time: DateTime<Utc>,
        module: Option<String>,
        migration_name: Option<String>,
        created_by: Option<String>,
    ) -> MigrateResult<Uuid> {
        self.registry.tenant(tenant_id).await?;
        match (&module, &migration_name) {
            (None, Some(name)) => {
                return Err(MigrateError::validation(format!(
                    "migration {name} scheduled without a module"
                )));
            }
            (Some(m), Some(name)) => {
                // Reject unknown module/migration before persisting
                self.engine_catalog_check(m, Some(name)).await?;
            }
            (Some(m), None) => {
                self.engine_catalog_check(m, None).await?;
            }
            (None, None) => {}
        }

        let job = ScheduledMigrationJob {
            schedule_id: Uuid::new_v4(),
            tenant_id,
            module,
            migration_name,
            scheduled_time,
            status: JobStatus::Pending,
            created_by: created_by.unwrap_or_else(|| "system".to_string()),
            created_at: Utc::now(),
            started_at: None,
            executed_at: None,
            error: None,
        };
        let schedule_id = job.schedule_id;
        self.store.insert(job).await?;
        info!(%schedule_id, %tenant_id, %scheduled_time, "migration scheduled");
        Ok(schedule_id)
    }

    async fn engine_catalog_check(&self, module: &str, name: Option<&str>) -> MigrateResult<()> {
        match name {
            Some(name) => self.engine.catalog().descriptor(module, name).await.map(|_| ()),
            None => self.engine.catalog().descriptors(module).await.map(|_| ()),
        }
    }

    /// Open (Pending or Running) jobs, ordered by scheduled time
    pub async fn list(&self) -> MigrateResult<Vec<ScheduledMigrationJob>> {
        self.store.list_open().await
    }

    pub async fn get(&self, schedule_id: Uuid) -> MigrateResult<ScheduledMigrationJob> {
        self.store
            .get(schedule_id)
            .await?
            .ok_or_else(|| MigrateError::not_found(format!("scheduled job {schedule_id}")))
    }

    /// Cancel a job that has not started running
    pub async fn cancel(&self, schedule_id: Uuid) -> MigrateResult<()> {
        self.store.cancel(schedule_id).await?;
        info!(%schedule_id, "scheduled migration cancelled");
        Ok(())
    }

    /// One sweep pass: reclaim stale claims, claim due jobs, execute
    /// them. Returns the number of jobs executed.
    pub async fn sweep(&self) -> MigrateResult<usize> {
        if !self.settings.get().await.enable_scheduled_migrations {
            return Ok(0);
        }

        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        self.store.reclaim_stale(cutoff).await?;

        let mut executed = 0;
        for job in self.store.due(now).await? {
            if !self.store.claim(job.schedule_id).await? {
                // Another sweep worker got there first
                continue;
            }
            debug!(schedule_id = %job.schedule_id, tenant_id = %job.tenant_id, "executing scheduled migration");
            let outcome = self.execute(&job).await;
            let error = match outcome {
                Ok(result) if result => None,
                Ok(_) => Some("apply batch failed".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(e) = &error {
                error!(schedule_id = %job.schedule_id, error = %e, "scheduled migration failed");
            } else {
                info!(schedule_id = %job.schedule_id, "scheduled migration completed");
            }
            self.store.complete(job.schedule_id, error).await?;
            executed += 1;
        }
        Ok(executed)
    }

    async fn execute(&self, job: &ScheduledMigrationJob) -> MigrateResult<bool> {
        let result = match (&job.module, &job.migration_name) {
            (Some(module), Some(name)) => {
                self.engine.apply_up_to(job.tenant_id, module, name).await?
            }
            (Some(module), None) => self.engine.apply(job.tenant_id, Some(module)).await?,
            _ => self.engine.apply(job.tenant_id, None).await?,
        };
        if let Some(e) = &result.error {
            return Err(MigrateError::storage(e.clone()));
        }
        Ok(result.success)
    }

    /// Spawn the periodic sweep loop. The handle stops the loop
    /// gracefully: no new claims, in-flight sweep finishes.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scheduler = self;
        let interval = scheduler.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.sweep().await {
                            error!(error = %e, "scheduler sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("scheduler sweep loop stopping");
                        break;
                    }
                }
            }
        });
        SchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running sweep loop
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the sweep loop and wait for the in-flight pass to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus, scheduled_time: DateTime<Utc>) -> ScheduledMigrationJob {
        ScheduledMigrationJob {
            schedule_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            module: None,
            migration_name: None,
            scheduled_time,
            status,
            created_by: "test".to_string(),
            created_at: Utc::now(),
            started_at: None,
            executed_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn claim_is_single_flight() {
        let store = MemoryJobStore::new();
        let j = job(JobStatus::Pending, Utc::now());
        let id = j.schedule_id;
        store.insert(j).await.unwrap();

        assert!(store.claim(id).await.unwrap());
        assert!(!store.claim(id).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn cancel_only_from_pending() {
        let store = MemoryJobStore::new();
        let j = job(JobStatus::Pending, Utc::now());
        let id = j.schedule_id;
        store.insert(j).await.unwrap();

        store.claim(id).await.unwrap();
        assert!(matches!(
            store.cancel(id).await,
            Err(MigrateError::Validation(_))
        ));

        let j2 = job(JobStatus::Pending, Utc::now());
        let id2 = j2.schedule_id;
        store.insert(j2).await.unwrap();
        store.cancel(id2).await.unwrap();
        assert_eq!(
            store.get(id2).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
        // Cancelled jobs can never be claimed
        assert!(!store.claim(id2).await.unwrap());
    }

    #[tokio::test]
    async fn due_returns_only_pending_past_jobs_in_order() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let early = job(JobStatus::Pending, now - chrono::Duration::minutes(10));
        let late = job(JobStatus::Pending, now - chrono::Duration::minutes(5));
        let future = job(JobStatus::Pending, now + chrono::Duration::minutes(5));
        let running = job(JobStatus::Running, now - chrono::Duration::minutes(20));
        let ids = (early.schedule_id, late.schedule_id);
        for j in [early, late, future, running] {
            store.insert(j).await.unwrap();
        }

        let due = store.due(now).await.unwrap();
        assert_eq!(
            due.iter().map(|j| j.schedule_id).collect::<Vec<_>>(),
            vec![ids.0, ids.1]
        );
    }

    #[tokio::test]
    async fn stale_running_jobs_are_reclaimed() {
        let store = MemoryJobStore::new();
        let mut j = job(JobStatus::Running, Utc::now());
        j.started_at = Some(Utc::now() - chrono::Duration::minutes(30));
        let id = j.schedule_id;
        store.insert(j).await.unwrap();

        let reclaimed = store
            .reclaim_stale(Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn complete_records_outcome() {
        let store = MemoryJobStore::new();
        let j = job(JobStatus::Pending, Utc::now());
        let id = j.schedule_id;
        store.insert(j).await.unwrap();
        store.claim(id).await.unwrap();
        store.complete(id, Some("boom".to_string())).await.unwrap();

        let done = store.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("boom"));
        assert!(done.executed_at.is_some());
    }

    #[tokio::test]
    async fn missing_queue_file_loads_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileJobStore::load(dir.path().join("jobs.json")).await.unwrap();
        assert!(store.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_queue_file_refuses_to_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        // Invalid UTF-8: read_to_string fails with something other than
        // NotFound, which must surface instead of emptying the queue
        tokio::fs::write(&path, [0xffu8, 0xfe, 0xfd]).await.unwrap();

        assert!(FileJobStore::load(&path).await.is_err());

        // The file is left untouched for the operator to inspect
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0xffu8, 0xfe, 0xfd]);
    }

    #[tokio::test]
    async fn corrupt_queue_file_refuses_to_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        assert!(FileJobStore::load(&path).await.is_err());
    }

    #[tokio::test]
    async fn file_store_survives_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");

        let j = job(JobStatus::Pending, Utc::now());
        let id = j.schedule_id;
        {
            let store = FileJobStore::load(&path).await.unwrap();
            store.insert(j).await.unwrap();
        }

        let store = FileJobStore::load(&path).await.unwrap();
        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
    }
}
