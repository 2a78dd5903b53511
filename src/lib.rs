//! # Converge
//!
//! Migration orchestration for platforms that run one isolated database
//! or schema per tenant. Converge discovers which migrations each tenant
//! is missing against a shared ordered catalog, applies them safely and
//! in order, rolls them back, previews their effect, and schedules
//! deferred runs — while guaranteeing that one tenant's failure never
//! affects another tenant's run.
//!
//! ## Modules
//!
//! - `catalog` - Ordered per-module migration descriptors and scripts
//! - `registry` - Tenant enumeration and connection handles
//! - `state` - Per-tenant applied-migration ledgers and transactions
//! - `status` - Pending/applied aggregation across the tenant fleet
//! - `apply` - Transactional, in-order application of pending migrations
//! - `rollback` - Latest-only rollback via backward scripts
//! - `preview` - Script and impact preview without execution
//! - `schedule` - Durable deferred jobs with a polling sweep loop
//! - `settings` - Process-wide migration configuration
//! - `lock` - Per-tenant advisory locks
//! - `hooks` - Backup and notification seams
//! - `service` - The orchestration facade tying it all together
//! - `testing` - Fixtures for driving the engine in tests

pub mod apply;
pub mod catalog;
pub mod cli;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod preview;
pub mod registry;
pub mod rollback;
pub mod schedule;
pub mod service;
pub mod settings;
pub mod state;
pub mod status;

pub mod testing;

pub use apply::{ApplyEngine, ApplyResult};
pub use catalog::{MigrationCatalog, MigrationDescriptor, StaticCatalog};
pub use error::{MigrateError, MigrateResult};
pub use preview::PreviewResult;
pub use registry::{StaticRegistry, Tenant, TenantRegistry};
pub use rollback::RollbackResult;
pub use schedule::{JobStatus, ScheduledMigrationJob, Scheduler};
pub use service::{MigrationService, MigrationServiceBuilder};
pub use settings::MigrationSettings;
pub use state::{AppliedMigrationRecord, TenantStateStore};
pub use status::TenantMigrationStatus;
