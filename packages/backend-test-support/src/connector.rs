use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use db_infra::config::db::ConnSpec;
use db_infra::{DatabaseSettings, DbInfraError, PoolConnector, SeaPoolConnector};
use sea_orm::{DatabaseConnection, DbErr, RuntimeErr};

/// Wraps the production connector and counts physical pool creation.
///
/// Can inject transient connect failures and a connect delay to widen race
/// windows.
pub struct CountingConnector {
    inner: SeaPoolConnector,
    connects: AtomicU32,
    terminations: AtomicU32,
    fail_next: AtomicU32,
    delay_ms: AtomicU64,
}

impl CountingConnector {
    pub fn new(settings: &DatabaseSettings) -> Arc<Self> {
        Arc::new(Self {
            inner: SeaPoolConnector::new(Arc::new(settings.clone())),
            connects: AtomicU32::new(0),
            terminations: AtomicU32::new(0),
            fail_next: AtomicU32::new(0),
            delay_ms: AtomicU64::new(0),
        })
    }

    /// Attempts that reached the backing store, successful or not.
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Fail the next `n` connects with a connection error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl PoolConnector for CountingConnector {
    async fn connect(&self, spec: &ConnSpec) -> Result<DatabaseConnection, DbInfraError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DbInfraError::Db(DbErr::Conn(RuntimeErr::Internal(
                format!("injected connect failure for {}", spec.database_name),
            ))));
        }

        self.inner.connect(spec).await
    }

    async fn terminate_sessions(&self, spec: &ConnSpec) -> Result<u64, DbInfraError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.inner.terminate_sessions(spec).await
    }
}
