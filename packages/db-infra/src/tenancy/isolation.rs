use futures::future::BoxFuture;
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseTransaction, Statement, TransactionTrait,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::db::IsolationPolicy;
use crate::error::DbInfraError;

const SQLITE_CONTEXT_TABLE: &str = "tenant_session_context";

/// Stamps a tenant context onto shared-store sessions for row-level policies.
///
/// The context lives inside a transaction: Postgres uses a transaction-local
/// `set_config`, SQLite a row in a TEMP table written inside the transaction.
/// Commit clears it explicitly; rollback (including the implicit rollback of a
/// dropped transaction) discards it, so it never outlives the scope.
#[derive(Debug, Clone)]
pub struct IsolationEnforcer {
    policy: IsolationPolicy,
}

impl IsolationEnforcer {
    pub fn new(policy: IsolationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &IsolationPolicy {
        &self.policy
    }

    pub async fn with_tenant_context<C, F, R>(
        &self,
        conn: &C,
        tenant_id: Uuid,
        f: F,
    ) -> Result<R, DbInfraError>
    where
        C: TransactionTrait + Sync,
        F: for<'c> FnOnce(&'c DatabaseTransaction) -> BoxFuture<'c, Result<R, DbInfraError>>
            + Send,
        R: Send,
    {
        let txn = conn.begin().await?;
        self.stamp(&txn, tenant_id).await?;

        match f(&txn).await {
            Ok(value) => {
                self.clear(&txn).await?;
                txn.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "rollback after scoped failure returned error");
                }
                Err(e)
            }
        }
    }

    async fn stamp(&self, txn: &DatabaseTransaction, tenant_id: Uuid) -> Result<(), DbInfraError> {
        let backend = txn.get_database_backend();
        match backend {
            DatabaseBackend::Postgres => {
                txn.execute(Statement::from_sql_and_values(
                    backend,
                    "SELECT set_config($1, $2, true)",
                    vec![self.policy.context_key.clone().into(), tenant_id.to_string().into()],
                ))
                .await?;
            }
            _ => {
                txn.execute(Statement::from_string(
                    backend,
                    format!(
                        "CREATE TEMP TABLE IF NOT EXISTS {SQLITE_CONTEXT_TABLE} \
                         (key TEXT PRIMARY KEY, value TEXT NOT NULL)"
                    ),
                ))
                .await?;
                txn.execute(Statement::from_sql_and_values(
                    backend,
                    format!(
                        "INSERT OR REPLACE INTO {SQLITE_CONTEXT_TABLE} (key, value) VALUES (?, ?)"
                    ),
                    vec![self.policy.context_key.clone().into(), tenant_id.to_string().into()],
                ))
                .await?;
            }
        }
        debug!(
            key = %self.policy.context_key,
            tenant_id = %tenant_id,
            restricted_tables = self.policy.restricted_tables.len(),
            "isolation=stamped"
        );
        Ok(())
    }

    async fn clear(&self, txn: &DatabaseTransaction) -> Result<(), DbInfraError> {
        let backend = txn.get_database_backend();
        let stmt = match backend {
            DatabaseBackend::Postgres => Statement::from_sql_and_values(
                backend,
                "SELECT set_config($1, '', true)",
                vec![self.policy.context_key.clone().into()],
            ),
            _ => Statement::from_sql_and_values(
                backend,
                format!("DELETE FROM {SQLITE_CONTEXT_TABLE} WHERE key = ?"),
                vec![self.policy.context_key.clone().into()],
            ),
        };
        txn.execute(stmt).await?;
        Ok(())
    }

    /// The tenant context visible on `conn` right now, if any.
    pub async fn current_context<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<Option<String>, DbInfraError> {
        let backend = conn.get_database_backend();
        let value = match backend {
            DatabaseBackend::Postgres => {
                let row = conn
                    .query_one(Statement::from_sql_and_values(
                        backend,
                        "SELECT current_setting($1, true) AS value",
                        vec![self.policy.context_key.clone().into()],
                    ))
                    .await?;
                match row {
                    Some(row) => row.try_get::<Option<String>>("", "value")?,
                    None => None,
                }
            }
            _ => {
                let table = conn
                    .query_one(Statement::from_sql_and_values(
                        backend,
                        "SELECT COUNT(*) AS n FROM sqlite_temp_master WHERE type = 'table' AND name = ?",
                        vec![SQLITE_CONTEXT_TABLE.into()],
                    ))
                    .await?;
                let exists = match table {
                    Some(row) => row.try_get::<i64>("", "n")? > 0,
                    None => false,
                };
                if !exists {
                    return Ok(None);
                }
                let row = conn
                    .query_one(Statement::from_sql_and_values(
                        backend,
                        format!("SELECT value FROM {SQLITE_CONTEXT_TABLE} WHERE key = ?"),
                        vec![self.policy.context_key.clone().into()],
                    ))
                    .await?;
                match row {
                    Some(row) => Some(row.try_get::<String>("", "value")?),
                    None => None,
                }
            }
        };
        Ok(value.filter(|v| !v.is_empty()))
    }

    /// Restricted tables that do not have row-level security enabled.
    /// SQLite has no row-level security, so nothing is reported there.
    pub async fn unenforced_tables<C: ConnectionTrait>(
        &self,
        conn: &C,
    ) -> Result<Vec<String>, DbInfraError> {
        if conn.get_database_backend() != DatabaseBackend::Postgres
            || self.policy.restricted_tables.is_empty()
        {
            return Ok(Vec::new());
        }
        let mut missing = Vec::new();
        for table in &self.policy.restricted_tables {
            let row = conn
                .query_one(Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "SELECT COUNT(*) AS n FROM pg_class \
                     WHERE relname = $1 AND relkind = 'r' AND relrowsecurity",
                    vec![table.clone().into()],
                ))
                .await?;
            let enforced = match row {
                Some(row) => row.try_get::<i64>("", "n")? > 0,
                None => false,
            };
            if !enforced {
                missing.push(table.clone());
            }
        }
        Ok(missing)
    }
}
