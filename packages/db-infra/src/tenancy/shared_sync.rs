use std::sync::Arc;

use sea_orm::DatabaseConnection;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::db::{shared_conn_spec, ConnSpec, DatabaseSettings, DbKind, DbOwner};
use crate::error::DbInfraError;
use crate::infra::db::core::build_admin_pool;
use crate::infra::db::diagnostics::MigrationCounters;
use crate::infra::db::locking::{acquire_with_backoff, store_lock};
use crate::tenancy::catalog::MigrationCatalog;
use crate::tenancy::ledger::{apply_pending, ApplyTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedSyncReport {
    pub database_name: String,
    pub applied_this_run: Vec<String>,
}

/// Brings the shared store's schema up to the shared catalog using the owner
/// credentials. Serialized in-process by a mutex and across processes by the
/// store lock; ledger rows carry the nil tenant id.
pub struct SharedSchemaSync {
    settings: Arc<DatabaseSettings>,
    catalog: MigrationCatalog,
    running: tokio::sync::Mutex<()>,
    counters: MigrationCounters,
}

impl SharedSchemaSync {
    pub fn new(settings: Arc<DatabaseSettings>, catalog: MigrationCatalog) -> Self {
        Self {
            settings,
            catalog,
            running: tokio::sync::Mutex::new(()),
            counters: MigrationCounters::default(),
        }
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    pub async fn synchronize(&self) -> Result<SharedSyncReport, DbInfraError> {
        let Ok(_running) = self.running.try_lock() else {
            self.counters.run_rejected();
            return Err(DbInfraError::MigrationInProgress {
                tenant: "shared".to_string(),
            });
        };

        let settings = self.settings.as_ref();
        let spec = shared_conn_spec(settings, DbOwner::Owner);

        // On Postgres the advisory lock pins its own transaction, so the
        // migration work needs a second owner connection.
        let lock_pool = build_admin_pool(settings).await?;
        let work_pool = match settings.db_kind {
            DbKind::Postgres => build_admin_pool(settings).await?,
            DbKind::SqliteFile | DbKind::SqliteMemory => lock_pool.clone(),
        };

        let result = self.run_locked(settings, &spec, &lock_pool, &work_pool).await;

        if settings.db_kind == DbKind::Postgres {
            if let Err(e) = work_pool.close().await {
                warn!(error = %e, "failed to close shared work pool");
            }
        }
        if let Err(e) = lock_pool.close().await {
            warn!(error = %e, "failed to close shared admin pool");
        }

        let applied_this_run = result?;
        info!(
            store = %spec.database_name,
            applied = applied_this_run.len(),
            "shared_sync=done"
        );
        Ok(SharedSyncReport {
            database_name: spec.database_name,
            applied_this_run,
        })
    }

    async fn run_locked(
        &self,
        settings: &DatabaseSettings,
        spec: &ConnSpec,
        lock_pool: &DatabaseConnection,
        work_pool: &DatabaseConnection,
    ) -> Result<Vec<String>, DbInfraError> {
        let mut lock = store_lock(settings, spec, lock_pool, "sync");
        let guard = acquire_with_backoff(lock.as_mut(), "shared", settings.migration_timeout).await?;

        self.counters.run_started();
        info!(store = %spec.database_name, migrations = self.catalog.len(), "shared_sync=start");

        let target = ApplyTarget {
            label: "shared",
            tenant_id: Uuid::nil(),
            conn: work_pool,
            statement_timeout: settings.statement_timeout,
            migration_timeout: settings.migration_timeout,
        };
        let result = apply_pending(&target, &self.catalog, &self.counters).await;

        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release shared sync guard");
        }
        result
    }
}
