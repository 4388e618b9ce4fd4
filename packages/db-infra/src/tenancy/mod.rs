//! Tenancy core: registry, per-tenant pools, migrations, isolation and stats,
//! assembled once at start-up and shared by reference.

pub mod catalog;
pub mod isolation;
pub mod ledger;
pub mod orchestrator;
pub mod pool_manager;
pub mod registry;
pub mod shared_sync;
pub mod stats;

use std::sync::Arc;

use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::db::{shared_conn_spec, DatabaseSettings, DbOwner};
use crate::entities::tenant_audit_log;
use crate::error::DbInfraError;
use crate::infra::db::connector::{PoolConnector, SeaPoolConnector};
use crate::infra::db::core::{build_pool, retry_connection, RetryPolicy};
use catalog::MigrationCatalog;
use isolation::IsolationEnforcer;
use orchestrator::MigrationOrchestrator;
use pool_manager::{CloseOptions, CloseOutcome, PoolManager};
use registry::{DrainRequest, TenantRegistry};
use shared_sync::SharedSchemaSync;
use stats::StatsReporter;

/// Every tenancy component, wired against one `DatabaseSettings`.
pub struct TenancyCore {
    settings: Arc<DatabaseSettings>,
    registry: Arc<TenantRegistry>,
    pools: PoolManager,
    migrations: Arc<MigrationOrchestrator>,
    isolation: IsolationEnforcer,
    stats: StatsReporter,
    shared_sync: Arc<SharedSchemaSync>,
    drain_rx: parking_lot::Mutex<Option<UnboundedReceiver<DrainRequest>>>,
}

/// Builder for `TenancyCore` (used in both tests and binaries).
pub struct TenancyBuilder {
    settings: DatabaseSettings,
    connector: Option<Arc<dyn PoolConnector>>,
    tenant_catalog: Option<MigrationCatalog>,
    shared_catalog: Option<MigrationCatalog>,
}

impl TenancyBuilder {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self {
            settings,
            connector: None,
            tenant_catalog: None,
            shared_catalog: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn PoolConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_tenant_catalog(mut self, catalog: MigrationCatalog) -> Self {
        self.tenant_catalog = Some(catalog);
        self
    }

    pub fn with_shared_catalog(mut self, catalog: MigrationCatalog) -> Self {
        self.shared_catalog = Some(catalog);
        self
    }

    /// Connect to the shared store, synchronize its schema when configured,
    /// then assemble the components. Tenant pools are opened lazily.
    pub async fn build(self) -> Result<TenancyCore, DbInfraError> {
        self.settings.validate()?;
        let settings = Arc::new(self.settings);

        let tenant_catalog = match self.tenant_catalog {
            Some(catalog) => catalog,
            None => MigrationCatalog::tenant()?,
        };
        let shared_catalog = match self.shared_catalog {
            Some(catalog) => catalog,
            None => MigrationCatalog::shared()?,
        };

        // The app pool is opened first so an in-memory shared store outlives
        // the short-lived admin pools used by synchronization.
        let shared = connect_shared(&settings).await?;

        let shared_sync = Arc::new(SharedSchemaSync::new(settings.clone(), shared_catalog));
        if settings.sync_shared_on_startup {
            let report = shared_sync.synchronize().await?;
            info!(applied = report.applied_this_run.len(), "bootstrap=shared_synced");
        }

        let (drain_tx, drain_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(TenantRegistry::new(
            shared,
            settings.clone(),
            Some(drain_tx),
        ));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SeaPoolConnector::new(settings.clone())));
        let pools = PoolManager::new(settings.clone(), registry.clone(), connector);
        let migrations = Arc::new(MigrationOrchestrator::new(
            pools.clone(),
            Arc::new(tenant_catalog),
        ));
        let isolation = IsolationEnforcer::new(settings.isolation.clone());
        let stats = StatsReporter::new(pools.clone(), migrations.clone());

        match isolation.unenforced_tables(registry.shared()).await {
            Ok(missing) if !missing.is_empty() => warn!(
                tables = ?missing,
                "row-level security is not enabled on restricted tables"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not inspect row-level security"),
        }

        info!(
            db_kind = ?settings.db_kind,
            shared_db = %settings.shared_db,
            pool_max = settings.pool.pool_max,
            "bootstrap=ready"
        );

        Ok(TenancyCore {
            settings,
            registry,
            pools,
            migrations,
            isolation,
            stats,
            shared_sync,
            drain_rx: parking_lot::Mutex::new(Some(drain_rx)),
        })
    }
}

async fn connect_shared(settings: &DatabaseSettings) -> Result<DatabaseConnection, DbInfraError> {
    let spec = shared_conn_spec(settings, DbOwner::App);
    let policy = RetryPolicy::from_settings(settings);
    let conn = retry_connection("shared", &policy, || build_pool(&spec)).await?;
    info!(url = %spec.sanitized_url(), "shared_pool=ready");
    Ok(conn)
}

pub fn build_tenancy(settings: DatabaseSettings) -> TenancyBuilder {
    TenancyBuilder::new(settings)
}

impl TenancyCore {
    pub fn settings(&self) -> &Arc<DatabaseSettings> {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn migrations(&self) -> &Arc<MigrationOrchestrator> {
        &self.migrations
    }

    pub fn isolation(&self) -> &IsolationEnforcer {
        &self.isolation
    }

    pub fn stats(&self) -> &StatsReporter {
        &self.stats
    }

    pub fn shared_sync(&self) -> &Arc<SharedSchemaSync> {
        &self.shared_sync
    }

    /// Start the idle sweeper and the drain listener. The listener can only
    /// be started once; later calls start the sweeper alone.
    pub fn spawn_background(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.pools.spawn_idle_sweeper(
            self.settings.idle_sweep_interval,
            self.settings.idle_threshold,
            token.clone(),
        )];
        if let Some(rx) = self.drain_rx.lock().take() {
            tasks.push(self.pools.spawn_drain_listener(rx, token));
        }
        tasks
    }

    /// Drain every tenant pool, then close the shared pool.
    pub async fn shutdown(&self) -> Vec<(Uuid, CloseOutcome)> {
        let outcomes = self
            .pools
            .close_all(CloseOptions::graceful(self.settings.close_timeout))
            .await;
        if let Err(e) = self.registry.shared().clone().close().await {
            warn!(error = %e, "failed to close shared pool");
        }
        info!(closed = outcomes.len(), "shutdown=complete");
        outcomes
    }

    /// Append an administrative action to the shared-store audit log under the
    /// tenant's row-level context.
    pub async fn record_admin_action(
        &self,
        tenant_id: Uuid,
        actor: &str,
        action: &str,
    ) -> Result<(), DbInfraError> {
        let actor = actor.to_string();
        let action = action.to_string();
        self.isolation
            .with_tenant_context(self.registry.shared(), tenant_id, move |txn| {
                Box::pin(async move {
                    tenant_audit_log::ActiveModel {
                        tenant_id: Set(tenant_id),
                        actor: Set(actor),
                        action: Set(action),
                        recorded_at: Set(OffsetDateTime::now_utc()),
                        ..Default::default()
                    }
                    .insert(txn)
                    .await?;
                    Ok(())
                })
            })
            .await
    }
}
