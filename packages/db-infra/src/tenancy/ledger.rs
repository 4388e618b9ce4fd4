//! Applied-migrations ledger and the transactional apply primitive shared by
//! tenant runs and shared-store synchronization.

use std::time::Duration;

use migration::SchemaManager;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryOrder, Schema, Set, Statement, TransactionTrait,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::{schema_migrations, AppliedMigration, SchemaMigrations};
use crate::error::DbInfraError;
use crate::infra::db::core::with_deadline;
use crate::infra::db::diagnostics::MigrationCounters;
use crate::tenancy::catalog::{MigrationCatalog, MigrationDescriptor};

pub const LEDGER_TABLE: &str = "schema_migrations";

pub async fn ensure_ledger<C: ConnectionTrait>(conn: &C) -> Result<(), DbInfraError> {
    let backend = conn.get_database_backend();
    let mut stmt = Schema::new(backend).create_table_from_entity(SchemaMigrations);
    stmt.if_not_exists();
    conn.execute(backend.build(&stmt)).await?;
    Ok(())
}

/// Read-only existence check, so `status` never creates the table.
pub async fn ledger_exists<C: ConnectionTrait>(conn: &C) -> Result<bool, DbInfraError> {
    let backend = conn.get_database_backend();
    let stmt = match backend {
        DatabaseBackend::Postgres => Statement::from_sql_and_values(
            backend,
            "SELECT COUNT(*) AS n FROM pg_class \
             WHERE relname = $1 AND relkind = 'r' AND pg_table_is_visible(oid)",
            vec![LEDGER_TABLE.into()],
        ),
        _ => Statement::from_sql_and_values(
            backend,
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?",
            vec![LEDGER_TABLE.into()],
        ),
    };
    let present = match conn.query_one(stmt).await? {
        Some(row) => row.try_get::<i64>("", "n")? > 0,
        None => false,
    };
    Ok(present)
}

pub async fn load<C: ConnectionTrait>(conn: &C) -> Result<Vec<AppliedMigration>, DbInfraError> {
    Ok(SchemaMigrations::find()
        .order_by_asc(schema_migrations::Column::Version)
        .order_by_asc(schema_migrations::Column::MigrationName)
        .all(conn)
        .await?)
}

/// The ledger must be a gap-free prefix of the catalog, recorded for this tenant.
pub fn validate_prefix(
    label: &str,
    tenant_id: Uuid,
    applied: &[AppliedMigration],
    catalog: &[MigrationDescriptor],
) -> Result<(), DbInfraError> {
    let inconsistent = |detail: String| DbInfraError::LedgerInconsistent {
        tenant: label.to_string(),
        detail,
    };

    if applied.len() > catalog.len() {
        return Err(inconsistent(format!(
            "{} records but the catalog has only {} migrations",
            applied.len(),
            catalog.len()
        )));
    }
    for (position, (record, expected)) in applied.iter().zip(catalog).enumerate() {
        if record.migration_name != expected.name || record.version != expected.version {
            return Err(inconsistent(format!(
                "record {} is {} (v{}), expected {} (v{})",
                position + 1,
                record.migration_name,
                record.version,
                expected.name,
                expected.version
            )));
        }
        if record.tenant_id != tenant_id {
            return Err(inconsistent(format!(
                "{} was recorded for tenant {}",
                record.migration_name, record.tenant_id
            )));
        }
    }
    Ok(())
}

async fn record(
    txn: &DatabaseTransaction,
    tenant_id: Uuid,
    descriptor: &MigrationDescriptor,
) -> Result<(), DbInfraError> {
    schema_migrations::ActiveModel {
        migration_name: Set(descriptor.idempotency_key.clone()),
        version: Set(descriptor.version),
        tenant_id: Set(tenant_id),
        applied_at: Set(OffsetDateTime::now_utc()),
    }
    .insert(txn)
    .await?;
    Ok(())
}

/// Where and under which limits `apply_pending` runs.
pub struct ApplyTarget<'a> {
    pub label: &'a str,
    pub tenant_id: Uuid,
    pub conn: &'a DatabaseConnection,
    pub statement_timeout: Duration,
    pub migration_timeout: Duration,
}

async fn rollback_quietly(label: &str, txn: DatabaseTransaction) {
    if let Err(e) = txn.rollback().await {
        warn!(tenant = label, error = %e, "rollback failed; connection discards the transaction");
    }
}

/// Apply every pending catalog migration in version order, one transaction per
/// migration: body, then ledger record, then commit. The ledger is re-read
/// inside each step's transaction, so a step recorded by a racing run is
/// skipped rather than re-executed. Stops at the first failure.
pub async fn apply_pending(
    target: &ApplyTarget<'_>,
    catalog: &MigrationCatalog,
    counters: &MigrationCounters,
) -> Result<Vec<String>, DbInfraError> {
    let label = target.label;
    let descriptors = catalog.descriptors();

    with_deadline(label, "ledger_init", target.statement_timeout, ensure_ledger(target.conn))
        .await?;

    let mut applied_this_run: Vec<String> = Vec::new();
    for (position, entry) in catalog.iter().enumerate() {
        let name = entry.descriptor.name.as_str();

        let txn = match with_deadline(label, "begin", target.statement_timeout, async {
            Ok(target.conn.begin().await?)
        })
        .await
        {
            Ok(txn) => txn,
            Err(e) => {
                counters.migration_failed();
                warn!(tenant = label, migration = name, error = %e, "migration=failed step=begin");
                return Err(e.at_migration(label, name, applied_this_run));
            }
        };

        let applied = match with_deadline(label, "ledger_read", target.statement_timeout, load(&txn)).await {
            Ok(applied) => applied,
            Err(e) => {
                rollback_quietly(label, txn).await;
                counters.migration_failed();
                warn!(tenant = label, migration = name, error = %e, "migration=failed step=ledger_read");
                return Err(e.at_migration(label, name, applied_this_run));
            }
        };

        let consistency = validate_prefix(label, target.tenant_id, &applied, &descriptors).and_then(|()| {
            if applied.len() < position {
                Err(DbInfraError::LedgerInconsistent {
                    tenant: label.to_string(),
                    detail: format!(
                        "{} is pending but only {} earlier migrations are recorded",
                        name,
                        applied.len()
                    ),
                })
            } else {
                Ok(())
            }
        });
        if let Err(e) = consistency {
            counters.ledger_inconsistent();
            rollback_quietly(label, txn).await;
            return Err(e);
        }

        if applied.iter().any(|r| r.migration_name == entry.descriptor.idempotency_key) {
            counters.migration_skipped();
            debug!(tenant = label, migration = name, "migration=skip already_applied");
            rollback_quietly(label, txn).await;
            continue;
        }

        let body = async {
            let manager = SchemaManager::new(&txn);
            entry.migration.up(&manager).await
        };
        let outcome = match tokio::time::timeout(target.migration_timeout, body).await {
            Ok(Ok(())) => record(&txn, target.tenant_id, &entry.descriptor).await,
            Ok(Err(e)) => Err(DbInfraError::Db(e)),
            Err(_) => {
                counters.body_timeout();
                Err(DbInfraError::timeout(
                    label,
                    format!("migration {name}"),
                    target.migration_timeout.as_millis() as u64,
                ))
            }
        };

        let outcome = match outcome {
            Ok(()) => txn.commit().await.map_err(DbInfraError::from),
            Err(e) => {
                rollback_quietly(label, txn).await;
                Err(e)
            }
        };

        if let Err(e) = outcome {
            counters.migration_failed();
            warn!(tenant = label, migration = name, error = %e, "migration=failed");
            return Err(e.at_migration(label, name, applied_this_run));
        }

        counters.migration_applied();
        info!(tenant = label, migration = name, version = entry.descriptor.version, "migration=applied");
        applied_this_run.push(name.to_string());
    }

    Ok(applied_this_run)
}
