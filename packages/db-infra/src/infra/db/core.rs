use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use sea_orm::{
    ConnectOptions, Database, DatabaseConnection, DbErr, RuntimeErr, SqlxPostgresConnector,
    SqlxSqliteConnector,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{debug, info, trace, warn};

use crate::config::db::{
    build_session_statements, shared_conn_spec, sanitize_db_url, ConnSpec, DatabaseSettings,
    DbKind, DbOwner,
};
use crate::error::DbInfraError;

/// Bounded exponential backoff used while a backing store is unreachable.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &DatabaseSettings) -> Self {
        Self {
            max_attempts: settings.connect_attempts.max(1),
            base_delay: Duration::from_millis(settings.connect_backoff_ms),
            max_delay: Duration::from_millis(settings.connect_backoff_max_ms),
        }
    }

    /// Delay before attempt `attempt + 1`: base doubled per attempt, capped, plus a little jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exp_ms = base_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
            .min(max_ms);
        let jitter_ms = if base_ms == 0 {
            0
        } else {
            rand::rng().random::<u64>() % (base_ms / 4 + 1)
        };
        Duration::from_millis(exp_ms + jitter_ms)
    }
}

/// Retry `connect_fn` while it fails with a transient error. Exhaustion surfaces
/// as `BackingStoreUnreachable` carrying the attempt count and the last cause.
pub async fn retry_connection<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut connect_fn: F,
) -> Result<T, DbInfraError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbInfraError>>,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts {
        match connect_fn().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        tenant = label,
                        attempts = attempt,
                        "connection_retry=success"
                    );
                }
                return Ok(result);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt < policy.max_attempts {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        tenant = label,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connection_retry=failed"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(DbInfraError::BackingStoreUnreachable {
        tenant: label.to_string(),
        attempts: policy.max_attempts,
        message: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no connection attempt was made".to_string()),
    })
}

/// Bound a backing-store call by `timeout`, mapping expiry to `BackingStoreTimeout`.
/// The future is dropped on expiry, which rolls back any transaction it owned.
pub async fn with_deadline<T, Fut>(
    label: &str,
    operation: &str,
    timeout: Duration,
    fut: Fut,
) -> Result<T, DbInfraError>
where
    Fut: Future<Output = Result<T, DbInfraError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                tenant = label,
                operation,
                timeout_ms = timeout.as_millis() as u64,
                "backing-store call timed out"
            );
            Err(DbInfraError::timeout(
                label,
                operation,
                timeout.as_millis() as u64,
            ))
        }
    }
}

fn connection_failed(e: sqlx::Error) -> DbInfraError {
    match e {
        sqlx::Error::Configuration(cause) => {
            DbInfraError::config(format!("invalid connection options: {cause}"))
        }
        other => DbInfraError::Db(DbErr::Conn(RuntimeErr::Internal(other.to_string()))),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), DbInfraError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .map_err(|e| {
                DbInfraError::config(format!(
                    "failed to create SQLite directory {}: {e}",
                    parent.display()
                ))
            }),
        _ => Ok(()),
    }
}

/// Build one pool from a connection descriptor. Session statements are applied
/// to every physical connection through the `after_connect` hook.
pub async fn build_pool(spec: &ConnSpec) -> Result<DatabaseConnection, DbInfraError> {
    let statements = build_session_statements(spec.db_kind, &spec.session);
    let acquire_timeout = Duration::from_millis(spec.pool.acquire_timeout_ms);

    match spec.db_kind {
        DbKind::SqliteFile | DbKind::SqliteMemory => {
            let connect_opts = SqliteConnectOptions::from_str(&spec.url)
                .map_err(connection_failed)?
                .create_if_missing(true);
            if spec.db_kind == DbKind::SqliteFile {
                ensure_parent_dir(connect_opts.get_filename())?;
            }

            let mut pool_opts = SqlitePoolOptions::new()
                .min_connections(spec.pool.pool_min)
                .max_connections(spec.pool.pool_max)
                .acquire_timeout(acquire_timeout);
            if spec.db_kind == DbKind::SqliteMemory {
                // A named in-memory store lives only as long as one of its connections.
                pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
            }

            let pool = pool_opts
                .after_connect(move |conn, _meta| {
                    let statements = statements.clone();
                    Box::pin(async move {
                        for stmt in &statements {
                            sqlx::query(stmt).execute(&mut *conn).await?;
                        }
                        trace!("db=sqlite hook=after_connect ok");
                        Ok::<_, sqlx::Error>(())
                    })
                })
                .connect_with(connect_opts)
                .await
                .map_err(connection_failed)?;

            // warm-up so a bad store fails here rather than on first use
            sqlx::query("SELECT 1;")
                .execute(&pool)
                .await
                .map_err(connection_failed)?;

            info!(
                tenant = %spec.label,
                store = %spec.database_name,
                engine = "sqlite",
                min = spec.pool.pool_min,
                max = spec.pool.pool_max,
                "pool=create"
            );
            Ok(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool))
        }
        DbKind::Postgres => {
            debug!(
                tenant = %spec.label,
                url = %spec.sanitized_url(),
                "pool=connecting engine=postgres"
            );
            let pool = PgPoolOptions::new()
                .min_connections(spec.pool.pool_min)
                .max_connections(spec.pool.pool_max)
                .acquire_timeout(acquire_timeout)
                .idle_timeout(Duration::from_secs(30))
                .after_connect(move |conn, _meta| {
                    let statements = statements.clone();
                    Box::pin(async move {
                        for stmt in &statements {
                            sqlx::query(stmt).execute(&mut *conn).await?;
                        }
                        Ok::<_, sqlx::Error>(())
                    })
                })
                .connect(&spec.url)
                .await
                .map_err(connection_failed)?;

            info!(
                tenant = %spec.label,
                store = %spec.database_name,
                engine = "postgres",
                min = spec.pool.pool_min,
                max = spec.pool.pool_max,
                "pool=create"
            );
            Ok(SqlxPostgresConnector::from_sqlx_postgres_pool(pool))
        }
    }
}

/// Build the single-connection owner pool on the shared store.
///
/// Used for shared-schema synchronization and for terminating tenant sessions.
pub async fn build_admin_pool(
    settings: &DatabaseSettings,
) -> Result<DatabaseConnection, DbInfraError> {
    let spec = shared_conn_spec(settings, DbOwner::Owner);
    if settings.db_kind == DbKind::SqliteFile {
        ensure_parent_dir(&settings.sqlite_dir.join(format!("{}.sqlite", spec.database_name)))?;
    }

    let mut opt = ConnectOptions::new(spec.url.clone());
    opt.min_connections(1)
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .sqlx_logging(false);

    // Postgres gets the fixed 5 x 500ms startup retry; local SQLite does not.
    let policy = match settings.db_kind {
        DbKind::Postgres => RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(500),
        },
        DbKind::SqliteFile | DbKind::SqliteMemory => RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    };

    let pool = retry_connection("shared", &policy, || {
        let opt = opt.clone();
        async move { Database::connect(opt).await.map_err(DbInfraError::from) }
    })
    .await?;

    debug!(url = %sanitize_db_url(&spec.url), "admin_pool=ready");
    Ok(pool)
}
