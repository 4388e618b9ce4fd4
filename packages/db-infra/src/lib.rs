//! Multi-tenant database connection and migration lifecycle.
//! Used by the admin backend and the migration CLI.

pub mod config;
pub mod entities;
pub mod error;
pub mod infra;
pub mod tenancy;

pub use config::db;
pub use config::db::{DatabaseSettings, DbKind, DbOwner};
pub use entities::{Tenant, TenantStatus};
pub use error::DbInfraError;
pub use infra::db::connector::{PoolConnector, SeaPoolConnector};
pub use infra::db::core::{build_admin_pool, build_pool};
pub use tenancy::catalog::{MigrationCatalog, MigrationDescriptor};
pub use tenancy::orchestrator::{MigrationRunReport, MigrationStatus, TenantRunResult};
pub use tenancy::pool_manager::{CloseOptions, CloseOutcome, ConnectionHandle, EntryState};
pub use tenancy::shared_sync::SharedSyncReport;
pub use tenancy::stats::StatsSnapshot;
pub use tenancy::{build_tenancy, TenancyBuilder, TenancyCore};

#[cfg(test)]
#[ctor::ctor]
fn init_test_logging() {
    backend_test_support::logging::init();
}
