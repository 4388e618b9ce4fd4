use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DatabaseTransaction, Statement,
    TransactionTrait,
};
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::db::{ConnSpec, DatabaseSettings, DbKind};
use crate::error::DbInfraError;

pub fn pg_lock_id(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as i64
}

/// A held cross-process lock.
///
/// The Postgres variant owns the transaction that holds the transaction-scoped
/// advisory lock; ending the transaction (or dropping it) releases the lock,
/// so a crashed holder never leaves it behind.
pub enum Guard {
    Postgres {
        txn: DatabaseTransaction,
        lock_key: i64,
    },
    SqliteFile {
        file: File,
        lock_path: PathBuf,
    },
    InMemory,
}

impl Guard {
    pub async fn release(self) -> Result<(), DbInfraError> {
        match self {
            Guard::Postgres { txn, lock_key } => {
                txn.rollback().await?;
                debug!(lock_key, "advisory lock released");
                Ok(())
            }
            Guard::SqliteFile { file, lock_path } => {
                use fs4::fs_std::FileExt;

                if let Err(e) = FileExt::unlock(&file) {
                    // the OS releases the lock when the handle drops anyway
                    debug!(
                        error = %e,
                        lock_path = %lock_path.display(),
                        "SQLite file unlock returned error (may be benign)"
                    );
                } else {
                    debug!(lock_path = %lock_path.display(), "SQLite file lock released");
                }
                Ok(())
            }
            Guard::InMemory => Ok(()),
        }
    }
}

/// Non-blocking cross-process lock acquisition.
#[async_trait]
pub trait BootstrapLock: Send {
    /// Returns `Some(Guard)` if acquired, `None` if another holder has it.
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError>;
}

/// Transaction-scoped Postgres advisory lock on the store being changed.
pub struct PgAdvisoryLock {
    conn: DatabaseConnection,
    lock_key: i64,
}

impl PgAdvisoryLock {
    pub fn new(conn: DatabaseConnection, key: &str) -> Self {
        Self {
            conn,
            lock_key: pg_lock_id(key),
        }
    }
}

#[async_trait]
impl BootstrapLock for PgAdvisoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        let txn = self.conn.begin().await?;
        let row = txn
            .query_one(Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "SELECT pg_try_advisory_xact_lock($1) AS locked",
                vec![self.lock_key.into()],
            ))
            .await?;

        let locked: bool = match row {
            Some(row) => row.try_get("", "locked")?,
            None => {
                txn.rollback().await?;
                return Err(DbInfraError::config(
                    "pg_try_advisory_xact_lock returned no row",
                ));
            }
        };

        if !locked {
            txn.rollback().await?;
            return Ok(None);
        }

        Ok(Some(Guard::Postgres {
            txn,
            lock_key: self.lock_key,
        }))
    }
}

/// OS-level exclusive lock on a sibling file of the SQLite store.
pub struct SqliteFileLock {
    lock_path: PathBuf,
}

impl SqliteFileLock {
    pub fn new(lock_path: &Path) -> Self {
        Self {
            lock_path: lock_path.to_path_buf(),
        }
    }
}

#[async_trait]
impl BootstrapLock for SqliteFileLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        use fs4::fs_std::FileExt;

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbInfraError::config(format!("failed to create lock file parent directory: {e}"))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| DbInfraError::config(format!("failed to open lock file: {e}")))?;

        match file.try_lock_exclusive() {
            Ok(true) => {
                debug!(lock_path = %self.lock_path.display(), "SQLite file lock acquired");
                Ok(Some(Guard::SqliteFile {
                    file,
                    lock_path: self.lock_path.clone(),
                }))
            }
            Ok(false) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(DbInfraError::config(format!(
                "failed to acquire SQLite file lock: {e}"
            ))),
        }
    }
}

/// In-memory stores live in one process; the in-process locks are enough.
pub struct InMemoryLock;

#[async_trait]
impl BootstrapLock for InMemoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        Ok(Some(Guard::InMemory))
    }
}

/// Pick the cross-process lock matching the store's engine.
/// `purpose` namespaces the key so unrelated operations never contend.
pub fn store_lock(
    settings: &DatabaseSettings,
    spec: &ConnSpec,
    conn: &DatabaseConnection,
    purpose: &str,
) -> Box<dyn BootstrapLock> {
    match spec.db_kind {
        DbKind::Postgres => Box::new(PgAdvisoryLock::new(
            conn.clone(),
            &format!("gestio:{purpose}:{}", spec.database_name),
        )),
        DbKind::SqliteFile => {
            let path = settings
                .sqlite_dir
                .join(format!("{}.{purpose}.lock", spec.database_name));
            Box::new(SqliteFileLock::new(&path))
        }
        DbKind::SqliteMemory => Box::new(InMemoryLock),
    }
}

/// Poll `lock` with short exponential backoff until acquired or `timeout` elapses.
pub async fn acquire_with_backoff(
    lock: &mut dyn BootstrapLock,
    label: &str,
    timeout: Duration,
) -> Result<Guard, DbInfraError> {
    let start = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        if let Some(guard) = lock.try_acquire().await? {
            trace!(
                lock = "won",
                tenant = label,
                attempts,
                elapsed_ms = start.elapsed().as_millis() as u64
            );
            return Ok(guard);
        }

        if start.elapsed() >= timeout {
            warn!(tenant = label, attempts, "lock acquisition timed out");
            return Err(DbInfraError::timeout(
                label,
                "lock_acquire",
                timeout.as_millis() as u64,
            ));
        }

        let base_delay_ms = (5u64 << attempts.saturating_sub(1).min(8)).min(80);
        let jitter_ms = rand::rng().random::<u64>() % 4;
        trace!(
            lock = "backoff",
            tenant = label,
            attempts,
            delay_ms = base_delay_ms + jitter_ms
        );
        tokio::time::sleep(Duration::from_millis(base_delay_ms + jitter_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_file_lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("erp_acme.migrate.lock");

        let mut first = SqliteFileLock::new(&path);
        let mut second = SqliteFileLock::new(&path);

        let guard = first.try_acquire().await.unwrap().expect("first holder");
        assert!(second.try_acquire().await.unwrap().is_none());

        guard.release().await.unwrap();
        let again = second.try_acquire().await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn backoff_acquisition_times_out_while_contended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("erp_shared.sync.lock");
        let mut holder = SqliteFileLock::new(&path);
        let _guard = holder.try_acquire().await.unwrap().unwrap();

        let mut waiter = SqliteFileLock::new(&path);
        let err = acquire_with_backoff(&mut waiter, "shared", Duration::from_millis(30))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DbInfraError::BackingStoreTimeout { .. }));
    }

    #[test]
    fn lock_ids_are_stable_per_key() {
        assert_eq!(pg_lock_id("gestio:migrate:erp_acme"), pg_lock_id("gestio:migrate:erp_acme"));
        assert_ne!(pg_lock_id("gestio:migrate:erp_acme"), pg_lock_id("gestio:migrate:erp_beta"));
    }
}
