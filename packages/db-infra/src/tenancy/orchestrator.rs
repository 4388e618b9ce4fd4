use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{AppliedMigration, Tenant, TenantStatus};
use crate::error::DbInfraError;
use crate::infra::db::core::with_deadline;
use crate::infra::db::diagnostics::{MigrationCounters, MigrationCountersSnapshot};
use crate::infra::db::locking::store_lock;
use crate::tenancy::catalog::{MigrationCatalog, MigrationDescriptor};
use crate::tenancy::ledger::{self, apply_pending, ApplyTarget};
use crate::tenancy::pool_manager::PoolManager;

const RUN_ALL_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub tenant_id: Uuid,
    pub code: String,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<MigrationDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRunReport {
    pub tenant_id: Uuid,
    pub code: String,
    pub applied_this_run: Vec<String>,
}

/// Per-tenant outcome of `run_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantRunResult {
    Succeeded {
        applied_this_run: Vec<String>,
    },
    Failed {
        error: String,
        message: String,
        migration: Option<String>,
        applied_this_run: Vec<String>,
    },
}

impl TenantRunResult {
    fn from_run(result: Result<MigrationRunReport, DbInfraError>) -> Self {
        match result {
            Ok(report) => TenantRunResult::Succeeded {
                applied_this_run: report.applied_this_run,
            },
            Err(e) => TenantRunResult::Failed {
                error: e.code().to_string(),
                message: e.to_string(),
                migration: e.migration().map(str::to_string),
                applied_this_run: e.applied_this_run().to_vec(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TenantRunResult::Succeeded { .. })
    }
}

/// Diffs the static catalog against each tenant's ledger and applies the
/// difference, one tenant run at a time per tenant.
pub struct MigrationOrchestrator {
    pools: PoolManager,
    catalog: Arc<MigrationCatalog>,
    run_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    counters: MigrationCounters,
}

impl MigrationOrchestrator {
    pub fn new(pools: PoolManager, catalog: Arc<MigrationCatalog>) -> Self {
        Self {
            pools,
            catalog,
            run_locks: DashMap::new(),
            counters: MigrationCounters::default(),
        }
    }

    pub fn catalog(&self) -> &MigrationCatalog {
        &self.catalog
    }

    pub fn counters(&self) -> MigrationCountersSnapshot {
        self.counters.snapshot()
    }

    fn run_lock(&self, tenant_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.run_locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the tenant's run lock once no run holds or awaits it.
    fn prune_run_lock(&self, tenant_id: Uuid) {
        self.run_locks
            .remove_if(&tenant_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn run_lock_count(&self) -> usize {
        self.run_locks.len()
    }

    /// Read-only view of applied and pending migrations.
    pub async fn status(&self, tenant_id: Uuid) -> Result<MigrationStatus, DbInfraError> {
        let handle = self.pools.acquire(tenant_id).await?;
        let timeout = self.pools.settings().statement_timeout;
        let code = handle.code().to_string();

        let applied = with_deadline(&code, "ledger_read", timeout, async {
            if ledger::ledger_exists(handle.connection()).await? {
                ledger::load(handle.connection()).await
            } else {
                Ok(Vec::new())
            }
        })
        .await?;
        handle.release();

        let catalog = self.catalog.descriptors();
        if let Err(e) = ledger::validate_prefix(&code, tenant_id, &applied, &catalog) {
            self.counters.ledger_inconsistent();
            warn!(tenant = %code, error = %e, "migrate=status ledger_inconsistent");
            return Err(e);
        }
        let pending = catalog.into_iter().skip(applied.len()).collect();

        Ok(MigrationStatus {
            tenant_id,
            code,
            applied,
            pending,
        })
    }

    /// Apply pending migrations. A concurrent run for the same tenant, in this
    /// process or another, is rejected with `MigrationInProgress`.
    pub async fn run(&self, tenant_id: Uuid) -> Result<MigrationRunReport, DbInfraError> {
        let tenant = self.pools.registry().get(tenant_id).await?;

        let lock = self.run_lock(tenant_id);
        let Ok(run) = lock.clone().try_lock_owned() else {
            self.counters.run_rejected();
            info!(tenant = %tenant.code, "migrate=rejected reason=in_progress");
            return Err(DbInfraError::MigrationInProgress {
                tenant: tenant.code,
            });
        };

        let result = self.run_locked(tenant).await;
        drop(run);
        drop(lock);
        self.prune_run_lock(tenant_id);
        result
    }

    async fn run_locked(&self, tenant: Tenant) -> Result<MigrationRunReport, DbInfraError> {
        let tenant_id = tenant.id;
        let handle = self.pools.acquire(tenant_id).await?;
        let settings = self.pools.settings().clone();

        let mut cross_process = store_lock(&settings, handle.spec(), handle.connection(), "migrate");
        let guard = match cross_process.try_acquire().await? {
            Some(guard) => guard,
            None => {
                self.counters.run_rejected();
                info!(tenant = %tenant.code, "migrate=rejected reason=held_by_other_process");
                return Err(DbInfraError::MigrationInProgress {
                    tenant: tenant.code,
                });
            }
        };

        self.counters.run_started();
        info!(tenant = %tenant.code, store = %tenant.database_name, "migrate=start");

        let target = ApplyTarget {
            label: &tenant.code,
            tenant_id,
            conn: handle.connection(),
            statement_timeout: settings.statement_timeout,
            migration_timeout: settings.migration_timeout,
        };
        let result = apply_pending(&target, &self.catalog, &self.counters).await;

        if let Err(e) = guard.release().await {
            warn!(tenant = %tenant.code, error = %e, "failed to release migration guard");
        }
        handle.release();

        let applied_this_run = result?;
        info!(
            tenant = %tenant.code,
            applied = applied_this_run.len(),
            "migrate=done"
        );
        Ok(MigrationRunReport {
            tenant_id,
            code: tenant.code,
            applied_this_run,
        })
    }

    /// Run every tenant matching `filter` independently; one tenant's failure
    /// never stops the others. Keyed by tenant code.
    pub async fn run_all(
        &self,
        filter: Option<TenantStatus>,
    ) -> Result<BTreeMap<String, TenantRunResult>, DbInfraError> {
        let tenants = self.pools.registry().list(filter).await?;
        info!(
            tenants = tenants.len(),
            filter = ?filter,
            "migrate_all=start"
        );

        let results: Vec<(String, TenantRunResult)> = stream::iter(tenants)
            .map(|tenant| async move {
                let result = self.run(tenant.id).await;
                (tenant.code, TenantRunResult::from_run(result))
            })
            .buffer_unordered(RUN_ALL_CONCURRENCY)
            .collect()
            .await;

        let failed = results.iter().filter(|(_, r)| !r.is_success()).count();
        self.counters.log_snapshot("migrate_all");
        info!(total = results.len(), failed, "migrate_all=done");
        Ok(results.into_iter().collect())
    }
}
