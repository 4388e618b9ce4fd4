use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::error::DbInfraError;
use crate::infra::db::core::with_deadline;
use crate::infra::db::diagnostics::{MigrationCountersSnapshot, PoolCountersSnapshot};
use crate::tenancy::orchestrator::MigrationOrchestrator;
use crate::tenancy::pool_manager::{EntrySnapshot, EntryState, PoolManager};

#[derive(Debug, Clone, Serialize)]
pub struct TenantStats {
    pub tenant_id: Uuid,
    pub code: String,
    pub database_name: String,
    pub state: EntryState,
    pub in_flight: u32,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub size_bytes: Option<i64>,
    pub row_estimate: Option<i64>,
    pub latency_ms: Option<u64>,
    pub degraded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SharedStoreStats {
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub size_bytes: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsTotals {
    pub pools: usize,
    pub open: usize,
    pub opening: usize,
    pub draining: usize,
    pub in_flight: u64,
    pub size_bytes: i64,
    pub degraded: usize,
    pub tenants_by_status: BTreeMap<String, u64>,
    pub pool_counters: PoolCountersSnapshot,
    pub migration_counters: MigrationCountersSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Unix epoch milliseconds.
    pub generated_at: i64,
    pub per_tenant: Vec<TenantStats>,
    pub totals: StatsTotals,
    pub shared: SharedStoreStats,
}

struct StoreSample {
    size_bytes: Option<i64>,
    row_estimate: Option<i64>,
}

/// Read-only aggregation over open pools. Never fails as a whole: a tenant
/// whose sample errors or exceeds the per-tenant timeout is marked degraded.
pub struct StatsReporter {
    pools: PoolManager,
    migrations: Arc<MigrationOrchestrator>,
}

impl StatsReporter {
    pub fn new(pools: PoolManager, migrations: Arc<MigrationOrchestrator>) -> Self {
        Self { pools, migrations }
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let timeout = self.pools.settings().stats_sample_timeout;
        let entries = self.pools.snapshot();

        let per_tenant: Vec<TenantStats> =
            join_all(entries.into_iter().map(|entry| self.tenant_stats(entry, timeout))).await;

        let registry = self.pools.registry();
        let (shared, tenants_by_status) = tokio::join!(
            sample_shared(registry.shared(), timeout),
            with_deadline("shared", "stats_status_counts", timeout, registry.count_by_status()),
        );
        let tenants_by_status = tenants_by_status.unwrap_or_else(|e| {
            debug!(error = %e, "stats=status_counts_unavailable");
            BTreeMap::new()
        });

        let count = |state: EntryState| per_tenant.iter().filter(|t| t.state == state).count();
        let totals = StatsTotals {
            pools: per_tenant.len(),
            open: count(EntryState::Open),
            opening: count(EntryState::Opening),
            draining: count(EntryState::Draining),
            in_flight: per_tenant.iter().map(|t| u64::from(t.in_flight)).sum(),
            size_bytes: per_tenant.iter().filter_map(|t| t.size_bytes).sum(),
            degraded: per_tenant.iter().filter(|t| t.degraded).count(),
            tenants_by_status,
            pool_counters: self.pools.counters(),
            migration_counters: self.migrations.counters(),
        };

        StatsSnapshot {
            generated_at: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            per_tenant,
            totals,
            shared,
        }
    }

    async fn tenant_stats(&self, entry: EntrySnapshot, timeout: Duration) -> TenantStats {
        let mut stats = TenantStats {
            tenant_id: entry.tenant_id,
            code: entry.code,
            database_name: entry.database_name,
            state: entry.state,
            in_flight: entry.in_flight,
            age_ms: entry.age_ms,
            idle_ms: entry.idle_ms,
            size_bytes: None,
            row_estimate: None,
            latency_ms: None,
            degraded: false,
            error: None,
        };

        // Only OPEN pools are sampled; opening or draining ones are reported as-is.
        let Some((conn, _spec)) = self.pools.sample_target(entry.tenant_id) else {
            return stats;
        };

        let start = Instant::now();
        match with_deadline(&stats.code, "stats_sample", timeout, sample_store(&conn)).await {
            Ok(sample) => {
                stats.latency_ms = Some(start.elapsed().as_millis() as u64);
                stats.size_bytes = sample.size_bytes;
                stats.row_estimate = sample.row_estimate;
            }
            Err(e) => {
                stats.degraded = true;
                stats.error = Some(e.to_string());
            }
        }
        stats
    }
}

async fn sample_shared(conn: &DatabaseConnection, timeout: Duration) -> SharedStoreStats {
    let start = Instant::now();
    match with_deadline("shared", "stats_sample", timeout, store_size(conn)).await {
        Ok(size_bytes) => SharedStoreStats {
            reachable: true,
            latency_ms: Some(start.elapsed().as_millis() as u64),
            size_bytes,
            error: None,
        },
        Err(e) => SharedStoreStats {
            reachable: false,
            latency_ms: None,
            size_bytes: None,
            error: Some(e.to_string()),
        },
    }
}

async fn store_size<C: ConnectionTrait>(conn: &C) -> Result<Option<i64>, DbInfraError> {
    let backend = conn.get_database_backend();
    let sql = match backend {
        DatabaseBackend::Postgres => "SELECT pg_database_size(current_database())::bigint AS size_bytes",
        _ => "SELECT (SELECT page_count FROM pragma_page_count()) \
              * (SELECT page_size FROM pragma_page_size()) AS size_bytes",
    };
    let row = conn.query_one(Statement::from_string(backend, sql)).await?;
    Ok(match row {
        Some(row) => row.try_get::<Option<i64>>("", "size_bytes")?,
        None => None,
    })
}

async fn sample_store<C: ConnectionTrait>(conn: &C) -> Result<StoreSample, DbInfraError> {
    let backend = conn.get_database_backend();
    let size_bytes = store_size(conn).await?;

    let row_estimate = match backend {
        DatabaseBackend::Postgres => {
            let row = conn
                .query_one(Statement::from_string(
                    backend,
                    "SELECT COALESCE(SUM(n_live_tup), 0)::bigint AS row_estimate \
                     FROM pg_stat_user_tables",
                ))
                .await?;
            match row {
                Some(row) => row.try_get::<Option<i64>>("", "row_estimate")?,
                None => None,
            }
        }
        _ => {
            let tables = conn
                .query_all(Statement::from_string(
                    backend,
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                ))
                .await?;
            let mut total = 0i64;
            for table in tables {
                let name: String = table.try_get("", "name")?;
                let row = conn
                    .query_one(Statement::from_string(
                        backend,
                        format!("SELECT COUNT(*) AS n FROM \"{}\"", name.replace('"', "\"\"")),
                    ))
                    .await?;
                if let Some(row) = row {
                    total += row.try_get::<i64>("", "n")?;
                }
            }
            Some(total)
        }
    };

    Ok(StoreSample {
        size_bytes,
        row_estimate,
    })
}
