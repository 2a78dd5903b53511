//! Command-line interface over the migration service.
//!
//! The CLI operates on a data directory holding the catalog definition,
//! tenant list, per-tenant ledgers, job queue, and settings record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::catalog::StaticCatalog;
use crate::hooks::LoggingHooks;
use crate::registry::{StaticRegistry, TenantRegistry};
use crate::schedule::FileJobStore;
use crate::service::MigrationService;
use crate::settings::FileSettingsStore;
use crate::state::FileStateBackend;

/// Converge tenant databases on a shared migration catalog
#[derive(Parser)]
#[command(name = "converge")]
#[command(about = "Multi-tenant schema migration orchestration", long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory with catalog.json and tenants.json
    #[arg(short, long, default_value = ".converge", global = true)]
    pub data_dir: PathBuf,

    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show pending and applied migrations for every tenant
    Status,
    /// Apply pending migrations to one tenant
    Apply {
        /// Tenant id or code
        tenant: String,
        /// Restrict to one module
        #[arg(long)]
        module: Option<String>,
    },
    /// Apply pending migrations to every active tenant
    ApplyAll,
    /// Preview a migration's script and impact for a tenant
    Preview {
        tenant: String,
        module: String,
        migration: String,
    },
    /// Roll back the latest applied migration of a module
    Rollback {
        tenant: String,
        module: String,
        migration: String,
    },
    /// Show a tenant's applied-migration history
    History { tenant: String },
    /// Manage scheduled migration jobs
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Show or update migration settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Run the scheduler sweep once, or keep sweeping with --watch
    Sweep {
        /// Keep the sweep loop running until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// List open scheduled jobs
    List,
    /// Schedule a deferred apply for a tenant
    Add {
        tenant: String,
        /// RFC 3339 time to run at, e.g. 2026-09-01T02:00:00Z
        #[arg(long)]
        at: DateTime<Utc>,
        #[arg(long)]
        module: Option<String>,
        #[arg(long)]
        migration: Option<String>,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Cancel a pending job
    Cancel { schedule_id: Uuid },
}

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// Print the current settings record
    Show,
    /// Update settings fields; unspecified fields keep their value
    Set {
        #[arg(long)]
        auto_apply: Option<bool>,
        #[arg(long)]
        backup: Option<bool>,
        #[arg(long)]
        scheduled: Option<bool>,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        #[arg(long)]
        notify_complete: Option<bool>,
        #[arg(long)]
        notify_failure: Option<bool>,
        /// Comma-separated notification recipients
        #[arg(long)]
        emails: Option<String>,
    },
}

async fn open_service(data_dir: &Path) -> Result<MigrationService> {
    let catalog = StaticCatalog::from_path(&data_dir.join("catalog.json"))
        .await
        .context("failed to load catalog.json")?;
    let registry = StaticRegistry::from_path(&data_dir.join("tenants.json"))
        .await
        .context("failed to load tenants.json")?;
    let state = Arc::new(FileStateBackend::new(data_dir.join("ledgers")));
    let settings = Arc::new(FileSettingsStore::load(data_dir.join("settings.json")).await?);
    let jobs = Arc::new(FileJobStore::load(data_dir.join("jobs.json")).await?);

    Ok(MigrationService::builder(registry, catalog, state)
        .settings_store(settings)
        .job_store(jobs)
        .backup_hook(Arc::new(LoggingHooks))
        .notification_hook(Arc::new(LoggingHooks))
        .build())
}

async fn resolve_tenant(registry: &Arc<dyn TenantRegistry>, selector: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(selector) {
        return Ok(id);
    }
    let tenants = registry.active_tenants().await?;
    tenants
        .iter()
        .find(|t| t.code.eq_ignore_ascii_case(selector))
        .map(|t| t.id)
        .with_context(|| format!("no active tenant with code {selector}"))
}

fn print<T: serde::Serialize>(value: &T, json: bool, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

pub async fn run(cli: Cli) -> Result<()> {
    let service = open_service(&cli.data_dir).await?;
    let registry = service.registry().clone();

    match cli.command {
        Commands::Status => {
            let statuses = service.list_pending_migrations().await?;
            print(&statuses, cli.json, |statuses| {
                for s in statuses {
                    let marker = if s.error.is_some() {
                        "!"
                    } else if s.has_pending() {
                        "*"
                    } else {
                        " "
                    };
                    println!("{marker} {} ({})", s.tenant_name, s.tenant_code);
                    if let Some(e) = &s.error {
                        println!("    error: {e}");
                        continue;
                    }
                    for (module, pending) in &s.pending_by_module {
                        if !pending.is_empty() {
                            println!("    {module}: {} pending: {}", pending.len(), pending.join(", "));
                        }
                    }
                }
            })?;
        }
        Commands::Apply { tenant, module } => {
            let tenant_id = resolve_tenant(&registry, &tenant).await?;
            let result = service.apply(tenant_id, module.as_deref()).await?;
            print(&result, cli.json, |r| {
                if r.success {
                    println!(
                        "{}: applied {} migration(s): {}",
                        r.tenant_name,
                        r.applied_migrations.len(),
                        r.applied_migrations.join(", ")
                    );
                } else {
                    println!(
                        "{}: FAILED after {} migration(s): {}",
                        r.tenant_name,
                        r.applied_migrations.len(),
                        r.error.as_deref().unwrap_or("unknown error")
                    );
                }
            })?;
        }
        Commands::ApplyAll => {
            let results = service.apply_all().await?;
            print(&results, cli.json, |results| {
                let ok = results.iter().filter(|r| r.success).count();
                for r in results {
                    let status = if r.success { "ok" } else { "failed" };
                    println!(
                        "{status:>6}  {} ({} applied){}",
                        r.tenant_name,
                        r.applied_migrations.len(),
                        r.error
                            .as_deref()
                            .map(|e| format!(" - {e}"))
                            .unwrap_or_default()
                    );
                }
                println!("{ok}/{} tenants succeeded", results.len());
            })?;
        }
        Commands::Preview {
            tenant,
            module,
            migration,
        } => {
            let tenant_id = resolve_tenant(&registry, &tenant).await?;
            let preview = service.preview(tenant_id, &module, &migration).await?;
            print(&preview, cli.json, |p| {
                println!("-- {}/{} for {}", p.module, p.migration_name, p.tenant_name);
                println!("-- affected tables: {}", p.affected_tables.join(", "));
                println!("-- estimated duration: {}s", p.estimated_duration_seconds);
                println!("{}", p.script);
            })?;
        }
        Commands::Rollback {
            tenant,
            module,
            migration,
        } => {
            let tenant_id = resolve_tenant(&registry, &tenant).await?;
            let result = service.rollback(tenant_id, &module, &migration).await?;
            print(&result, cli.json, |r| {
                println!(
                    "{}: rolled back {}/{} at {}",
                    r.tenant_name, r.module, r.migration_name, r.rolled_back_at
                );
            })?;
        }
        Commands::History { tenant } => {
            let tenant_id = resolve_tenant(&registry, &tenant).await?;
            let history = service.history(tenant_id).await?;
            print(&history, cli.json, |h| {
                println!("{} ({}): {} applied", h.tenant_name, h.tenant_code, h.total_applied);
                for (module, applied) in &h.applied_by_module {
                    if !applied.is_empty() {
                        println!("    {module}: {}", applied.join(", "));
                    }
                }
            })?;
        }
        Commands::Schedule { command } => match command {
            ScheduleCommands::List => {
                let jobs = service.list_scheduled().await?;
                print(&jobs, cli.json, |jobs| {
                    for j in jobs {
                        println!(
                            "{} {:?} tenant={} at={} target={}",
                            j.schedule_id,
                            j.status,
                            j.tenant_id,
                            j.scheduled_time,
                            match (&j.module, &j.migration_name) {
                                (Some(m), Some(n)) => format!("{m}/{n}"),
                                (Some(m), None) => m.clone(),
                                _ => "all pending".to_string(),
                            }
                        );
                    }
                })?;
            }
            ScheduleCommands::Add {
                tenant,
                at,
                module,
                migration,
                created_by,
            } => {
                let tenant_id = resolve_tenant(&registry, &tenant).await?;
                let schedule_id = service
                    .schedule(tenant_id, at, module, migration, created_by)
                    .await?;
                println!("scheduled {schedule_id}");
            }
            ScheduleCommands::Cancel { schedule_id } => {
                service.cancel_scheduled(schedule_id).await?;
                println!("cancelled {schedule_id}");
            }
        },
        Commands::Settings { command } => match command {
            SettingsCommands::Show => {
                let settings = service.get_settings().await;
                print(&settings, cli.json, |s| {
                    println!("auto_apply_migrations        = {}", s.auto_apply_migrations);
                    println!("backup_before_migration      = {}", s.backup_before_migration);
                    println!("enable_scheduled_migrations  = {}", s.enable_scheduled_migrations);
                    println!("migration_timeout_seconds    = {}", s.migration_timeout_seconds);
                    println!("notify_on_migration_complete = {}", s.notify_on_migration_complete);
                    println!("notify_on_migration_failure  = {}", s.notify_on_migration_failure);
                    println!("notification_emails          = {}", s.notification_emails.join(", "));
                })?;
            }
            SettingsCommands::Set {
                auto_apply,
                backup,
                scheduled,
                timeout_seconds,
                notify_complete,
                notify_failure,
                emails,
            } => {
                let mut settings = service.get_settings().await;
                if let Some(v) = auto_apply {
                    settings.auto_apply_migrations = v;
                }
                if let Some(v) = backup {
                    settings.backup_before_migration = v;
                }
                if let Some(v) = scheduled {
                    settings.enable_scheduled_migrations = v;
                }
                if let Some(v) = timeout_seconds {
                    settings.migration_timeout_seconds = v;
                }
                if let Some(v) = notify_complete {
                    settings.notify_on_migration_complete = v;
                }
                if let Some(v) = notify_failure {
                    settings.notify_on_migration_failure = v;
                }
                if let Some(v) = emails {
                    settings.notification_emails =
                        v.split(',').map(|e| e.trim().to_string()).collect();
                }
                service.update_settings(settings).await?;
                println!("settings updated");
            }
        },
        Commands::Sweep { watch } => {
            if !service.get_settings().await.enable_scheduled_migrations {
                bail!("scheduled migrations are disabled; enable with `converge settings set --scheduled true`");
            }
            if watch {
                let handle = service.start_scheduler();
                tokio::signal::ctrl_c().await?;
                handle.shutdown().await;
            } else {
                let executed = service.sweep().await?;
                println!("executed {executed} scheduled job(s)");
            }
        }
    }
    Ok(())
}
