use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tracing::{info, warn};

use crate::config::db::{ConnSpec, DatabaseSettings, DbKind};
use crate::error::DbInfraError;
use crate::infra::db::core::{build_admin_pool, build_pool};

/// Seam between the pool manager and the physical backing stores.
///
/// `connect` makes a single attempt; retry and backoff belong to the caller.
#[async_trait]
pub trait PoolConnector: Send + Sync + 'static {
    async fn connect(&self, spec: &ConnSpec) -> Result<DatabaseConnection, DbInfraError>;

    /// Forcibly end every backend session attached to `spec`'s store.
    /// Returns the number of sessions terminated.
    async fn terminate_sessions(&self, spec: &ConnSpec) -> Result<u64, DbInfraError>;
}

/// Production connector: sqlx pools handed to SeaORM.
pub struct SeaPoolConnector {
    settings: Arc<DatabaseSettings>,
}

impl SeaPoolConnector {
    pub fn new(settings: Arc<DatabaseSettings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PoolConnector for SeaPoolConnector {
    async fn connect(&self, spec: &ConnSpec) -> Result<DatabaseConnection, DbInfraError> {
        build_pool(spec).await
    }

    async fn terminate_sessions(&self, spec: &ConnSpec) -> Result<u64, DbInfraError> {
        match spec.db_kind {
            // Closing the pool is the whole session lifecycle for an embedded store.
            DbKind::SqliteFile | DbKind::SqliteMemory => Ok(0),
            DbKind::Postgres => {
                let admin = build_admin_pool(&self.settings).await?;
                let rows = admin
                    .query_all(Statement::from_sql_and_values(
                        DatabaseBackend::Postgres,
                        "SELECT pg_terminate_backend(pid) AS terminated \
                         FROM pg_stat_activity \
                         WHERE datname = $1 AND pid <> pg_backend_pid()",
                        vec![spec.database_name.clone().into()],
                    ))
                    .await;
                let terminated = match rows {
                    Ok(rows) => rows
                        .iter()
                        .filter(|row| row.try_get::<bool>("", "terminated").unwrap_or(false))
                        .count() as u64,
                    Err(e) => {
                        warn!(tenant = %spec.label, error = %e, "session termination failed");
                        if let Err(close_err) = admin.close().await {
                            warn!(error = %close_err, "failed to close admin pool");
                        }
                        return Err(e.into());
                    }
                };
                if let Err(close_err) = admin.close().await {
                    warn!(error = %close_err, "failed to close admin pool");
                }
                info!(
                    tenant = %spec.label,
                    store = %spec.database_name,
                    terminated,
                    "sessions=terminated"
                );
                Ok(terminated)
            }
        }
    }
}
