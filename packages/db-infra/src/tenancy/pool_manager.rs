use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::db::{tenant_conn_spec, ConnSpec, DatabaseSettings};
use crate::entities::Tenant;
use crate::error::DbInfraError;
use crate::infra::db::connector::PoolConnector;
use crate::infra::db::core::{retry_connection, with_deadline, RetryPolicy};
use crate::infra::db::diagnostics::{PoolCounters, PoolCountersSnapshot};
use crate::tenancy::registry::{DrainRequest, TenantRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    Opening,
    Open,
    Draining,
    Closed,
}

struct EntryInner {
    state: EntryState,
    in_flight: u32,
    last_used: Instant,
    conn: Option<DatabaseConnection>,
}

/// One tenant's pool. Lives in the manager's map from first access until CLOSED.
pub struct PoolEntry {
    tenant_id: Uuid,
    code: String,
    spec: ConnSpec,
    created_at: Instant,
    inner: Mutex<EntryInner>,
    drained: Notify,
}

enum Checkout {
    Ready(DatabaseConnection),
    Draining,
    NotReady,
}

impl PoolEntry {
    fn opening(tenant_id: Uuid, code: &str, spec: ConnSpec) -> Self {
        let now = Instant::now();
        Self {
            tenant_id,
            code: code.to_string(),
            spec,
            created_at: now,
            inner: Mutex::new(EntryInner {
                state: EntryState::Opening,
                in_flight: 0,
                last_used: now,
                conn: None,
            }),
            drained: Notify::new(),
        }
    }

    pub fn state(&self) -> EntryState {
        self.inner.lock().state
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.lock().in_flight
    }

    fn mark_open(&self, conn: DatabaseConnection) {
        let mut inner = self.inner.lock();
        inner.conn = Some(conn);
        inner.state = EntryState::Open;
        inner.last_used = Instant::now();
    }

    fn try_checkout(&self) -> Checkout {
        let mut inner = self.inner.lock();
        match (inner.state, inner.conn.clone()) {
            (EntryState::Open, Some(conn)) => {
                inner.in_flight += 1;
                inner.last_used = Instant::now();
                Checkout::Ready(conn)
            }
            (EntryState::Draining, _) => Checkout::Draining,
            _ => Checkout::NotReady,
        }
    }

    /// Returns true when this check-in completes a drain.
    fn checkin(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.last_used = Instant::now();
        inner.state == EntryState::Draining && inner.in_flight == 0
    }

    /// OPEN -> DRAINING. Returns the in-flight count observed at the transition,
    /// or `None` if the entry was not open or draining.
    fn begin_drain(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        match inner.state {
            EntryState::Open | EntryState::Draining => {
                inner.state = EntryState::Draining;
                Some(inner.in_flight)
            }
            EntryState::Opening | EntryState::Closed => None,
        }
    }

    fn begin_drain_if_idle(&self, max_idle: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == EntryState::Open
            && inner.in_flight == 0
            && inner.last_used.elapsed() >= max_idle
        {
            inner.state = EntryState::Draining;
            true
        } else {
            false
        }
    }

    /// -> CLOSED. Hands back the pool to close, exactly once.
    fn mark_closed(&self) -> Option<Option<DatabaseConnection>> {
        let mut inner = self.inner.lock();
        if inner.state == EntryState::Closed {
            return None;
        }
        inner.state = EntryState::Closed;
        Some(inner.conn.take())
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.drained.notified();
            if self.state() == EntryState::Closed {
                return;
            }
            notified.await;
        }
    }

    fn snapshot(&self) -> EntrySnapshot {
        let inner = self.inner.lock();
        EntrySnapshot {
            tenant_id: self.tenant_id,
            code: self.code.clone(),
            database_name: self.spec.database_name.clone(),
            state: inner.state,
            in_flight: inner.in_flight,
            age_ms: self.created_at.elapsed().as_millis() as u64,
            idle_ms: inner.last_used.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub tenant_id: Uuid,
    pub code: String,
    pub database_name: String,
    pub state: EntryState,
    pub in_flight: u32,
    pub age_ms: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOptions {
    pub graceful: bool,
    pub timeout: Duration,
}

impl CloseOptions {
    pub fn graceful(timeout: Duration) -> Self {
        Self {
            graceful: true,
            timeout,
        }
    }

    pub fn forced() -> Self {
        Self {
            graceful: false,
            timeout: Duration::ZERO,
        }
    }
}

/// Result of `close`. `ForcedTermination` is a warning: the entry is closed,
/// in-flight work was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseOutcome {
    NotOpen,
    Drained {
        waited_ms: u64,
    },
    ForcedTermination {
        abandoned_in_flight: u32,
        terminated_sessions: u64,
    },
}

struct Inner {
    settings: Arc<DatabaseSettings>,
    registry: Arc<TenantRegistry>,
    connector: Arc<dyn PoolConnector>,
    retry: RetryPolicy,
    entries: DashMap<Uuid, Arc<PoolEntry>>,
    creation_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    sweep_lock: tokio::sync::Mutex<()>,
    counters: PoolCounters,
}

impl Inner {
    fn creation_lock(&self, tenant_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the tenant's creation lock once nobody holds or awaits it.
    fn prune_creation_lock(&self, tenant_id: Uuid) {
        self.creation_locks
            .remove_if(&tenant_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn entry(&self, tenant_id: Uuid) -> Option<Arc<PoolEntry>> {
        self.entries.get(&tenant_id).map(|e| e.value().clone())
    }

    /// Complete the transition to CLOSED: remove this exact entry from the map,
    /// wake drain waiters, close the pool in the background.
    fn finalize(&self, entry: &Arc<PoolEntry>) {
        let Some(conn) = entry.mark_closed() else {
            return;
        };
        self.entries
            .remove_if(&entry.tenant_id, |_, current| Arc::ptr_eq(current, entry));
        entry.drained.notify_waiters();

        if let Some(conn) = conn {
            self.counters.pool_closed();
            info!(tenant = %entry.code, "pool=closed");
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    let code = entry.code.clone();
                    rt.spawn(async move {
                        if let Err(e) = conn.close().await {
                            debug!(tenant = %code, error = %e, "pool close returned error");
                        }
                    });
                }
                // outside a runtime the pool is dropped, which closes it lazily
                Err(_) => drop(conn),
            }
        }
    }

    fn checkin(&self, entry: &Arc<PoolEntry>) {
        if entry.checkin() {
            debug!(tenant = %entry.code, "drain=complete on release");
            self.finalize(entry);
        }
    }
}

/// Removes a half-built OPENING entry if `acquire` is cancelled or fails mid-creation.
struct OpeningGuard<'a> {
    inner: &'a Inner,
    entry: Arc<PoolEntry>,
    armed: bool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.finalize(&self.entry);
        }
    }
}

/// A checked-out connection to one tenant's store. Dropping it releases it.
pub struct ConnectionHandle {
    conn: DatabaseConnection,
    entry: Arc<PoolEntry>,
    manager: Arc<Inner>,
    released: bool,
}

impl ConnectionHandle {
    pub fn tenant_id(&self) -> Uuid {
        self.entry.tenant_id
    }

    pub fn code(&self) -> &str {
        &self.entry.code
    }

    pub fn spec(&self) -> &ConnSpec {
        &self.entry.spec
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn release(mut self) {
        self.checkin();
    }

    fn checkin(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.checkin(&self.entry);
        }
    }
}

impl Deref for ConnectionHandle {
    type Target = DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.checkin();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("tenant_id", &self.entry.tenant_id)
            .field("code", &self.entry.code)
            .finish()
    }
}

/// Owns one pool per tenant, created lazily and at most once at a time.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<Inner>,
}

impl PoolManager {
    pub fn new(
        settings: Arc<DatabaseSettings>,
        registry: Arc<TenantRegistry>,
        connector: Arc<dyn PoolConnector>,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            inner: Arc::new(Inner {
                settings,
                registry,
                connector,
                retry,
                entries: DashMap::new(),
                creation_locks: DashMap::new(),
                sweep_lock: tokio::sync::Mutex::new(()),
                counters: PoolCounters::default(),
            }),
        }
    }

    fn handle(&self, conn: DatabaseConnection, entry: Arc<PoolEntry>) -> ConnectionHandle {
        self.inner.counters.acquired();
        ConnectionHandle {
            conn,
            entry,
            manager: self.inner.clone(),
            released: false,
        }
    }

    fn refuse_draining(&self, code: &str) -> DbInfraError {
        self.inner.counters.acquire_rejected();
        DbInfraError::unavailable(code, "connection pool is draining")
    }

    pub async fn acquire(&self, tenant_id: Uuid) -> Result<ConnectionHandle, DbInfraError> {
        let tenant = match self.inner.registry.get_operable(tenant_id).await {
            Ok(tenant) => tenant,
            Err(e) => {
                self.inner.counters.acquire_rejected();
                return Err(e);
            }
        };

        // Fast path: outside the creation lock. A draining entry is rechecked
        // under the lock, since an idle eviction may be finishing.
        if let Some(entry) = self.inner.entry(tenant_id) {
            if let Checkout::Ready(conn) = entry.try_checkout() {
                return Ok(self.handle(conn, entry));
            }
        }

        let lock = self.inner.creation_lock(tenant_id);
        let result = self.checkout_or_create(&tenant, &lock).await;
        drop(lock);
        self.inner.prune_creation_lock(tenant_id);
        result
    }

    async fn checkout_or_create(
        &self,
        tenant: &Tenant,
        lock: &tokio::sync::Mutex<()>,
    ) -> Result<ConnectionHandle, DbInfraError> {
        let tenant_id = tenant.id;
        let wait_start = Instant::now();
        let _creation = lock.lock().await;
        let waited_ms = wait_start.elapsed().as_millis() as u64;
        if waited_ms > 0 {
            self.inner.counters.creation_wait();
            debug!(tenant = %tenant.code, wait_ms = waited_ms, "pool=dedup_wait");
        }

        // Second check: whoever held the lock before us may have built it.
        // Idle eviction drains under this lock, so DRAINING here is a close.
        if let Some(entry) = self.inner.entry(tenant_id) {
            match entry.try_checkout() {
                Checkout::Ready(conn) => return Ok(self.handle(conn, entry)),
                Checkout::Draining => return Err(self.refuse_draining(&tenant.code)),
                Checkout::NotReady => {
                    self.inner.finalize(&entry);
                }
            }
        }

        let spec = tenant_conn_spec(&self.inner.settings, &tenant.code, &tenant.database_name)?;
        let entry = Arc::new(PoolEntry::opening(tenant_id, &tenant.code, spec.clone()));
        self.inner.entries.insert(tenant_id, entry.clone());
        let mut opening = OpeningGuard {
            inner: &self.inner,
            entry: entry.clone(),
            armed: true,
        };

        let counters = &self.inner.counters;
        let connector = &self.inner.connector;
        let conn = retry_connection(&tenant.code, &self.inner.retry, || {
            counters.connect_attempt();
            let spec = &spec;
            async move {
                let result = connector.connect(spec).await;
                if result.is_err() {
                    counters.connect_failure();
                }
                result
            }
        })
        .await?;

        opening.armed = false;
        entry.mark_open(conn);
        self.inner.counters.pool_opened();
        info!(tenant = %tenant.code, store = %spec.database_name, "pool=open");

        match entry.try_checkout() {
            Checkout::Ready(conn) => Ok(self.handle(conn, entry)),
            _ => Err(self.refuse_draining(&tenant.code)),
        }
    }

    /// Explicit form of dropping the handle.
    pub fn release(&self, handle: ConnectionHandle) {
        handle.release();
    }

    pub async fn close(
        &self,
        tenant_id: Uuid,
        mut opts: CloseOptions,
    ) -> Result<CloseOutcome, DbInfraError> {
        let cap = self.inner.settings.close_timeout_max;
        if opts.timeout > cap {
            debug!(
                requested_ms = opts.timeout.as_millis() as u64,
                cap_ms = cap.as_millis() as u64,
                "close timeout capped"
            );
            opts.timeout = cap;
        }

        let entry = {
            // waits out an in-progress creation; never held while draining
            let lock = self.inner.creation_lock(tenant_id);
            let entry = {
                let _creation = lock.lock().await;
                self.inner.entry(tenant_id)
            };
            drop(lock);
            self.inner.prune_creation_lock(tenant_id);
            match entry {
                Some(entry) => entry,
                None => return Ok(CloseOutcome::NotOpen),
            }
        };

        let Some(in_flight) = entry.begin_drain() else {
            return Ok(CloseOutcome::NotOpen);
        };
        info!(
            tenant = %entry.code,
            in_flight,
            graceful = opts.graceful,
            timeout_ms = opts.timeout.as_millis() as u64,
            "pool=draining"
        );

        let start = Instant::now();
        if in_flight == 0 {
            self.inner.finalize(&entry);
            return Ok(CloseOutcome::Drained { waited_ms: 0 });
        }

        if opts.graceful
            && tokio::time::timeout(opts.timeout, entry.wait_closed())
                .await
                .is_ok()
        {
            return Ok(CloseOutcome::Drained {
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }

        // Either non-graceful or the drain timed out: abandon in-flight work.
        let abandoned_in_flight = entry.in_flight();
        if abandoned_in_flight == 0 {
            self.inner.finalize(&entry);
            return Ok(CloseOutcome::Drained {
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }

        let terminated = with_deadline(
            &entry.code,
            "terminate_sessions",
            self.inner.settings.statement_timeout,
            self.inner.connector.terminate_sessions(&entry.spec),
        )
        .await;
        let terminated_sessions = match terminated {
            Ok(n) => n,
            Err(e) => {
                warn!(tenant = %entry.code, error = %e, "session termination failed; closing anyway");
                0
            }
        };
        self.inner.finalize(&entry);
        self.inner.counters.forced_termination();
        warn!(
            tenant = %entry.code,
            abandoned_in_flight,
            terminated_sessions,
            "pool=forced_termination"
        );
        Ok(CloseOutcome::ForcedTermination {
            abandoned_in_flight,
            terminated_sessions,
        })
    }

    /// Close every entry with the same options; used at shutdown.
    pub async fn close_all(&self, opts: CloseOptions) -> Vec<(Uuid, CloseOutcome)> {
        let ids: Vec<Uuid> = self.inner.entries.iter().map(|e| *e.key()).collect();
        let closes = ids.into_iter().map(|id| async move {
            let outcome = self.close(id, opts).await.unwrap_or(CloseOutcome::NotOpen);
            (id, outcome)
        });
        join_all(closes).await
    }

    /// Drain every OPEN, idle entry. At most one sweep runs at a time; a
    /// concurrent call returns immediately with zero evictions.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let Ok(_sweep) = self.inner.sweep_lock.try_lock() else {
            debug!("idle_sweep=skipped reason=already_running");
            return 0;
        };

        let candidates: Vec<Arc<PoolEntry>> =
            self.inner.entries.iter().map(|e| e.value().clone()).collect();
        let mut evicted = 0;
        for entry in candidates {
            // Held across drain and removal so a concurrent acquire waits and
            // then builds a fresh pool; a tenant mid-creation is skipped.
            let lock = self.inner.creation_lock(entry.tenant_id);
            let drained = match lock.try_lock() {
                Ok(_creation) => {
                    let drained = entry.begin_drain_if_idle(max_idle);
                    if drained {
                        self.inner.finalize(&entry);
                    }
                    drained
                }
                Err(_) => false,
            };
            drop(lock);
            self.inner.prune_creation_lock(entry.tenant_id);
            if drained {
                self.inner.counters.idle_eviction();
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, max_idle_ms = max_idle.as_millis() as u64, "idle_sweep=done");
        }
        evicted
    }

    pub fn spawn_idle_sweeper(
        &self,
        interval: Duration,
        max_idle: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.evict_idle(max_idle).await;
                    }
                }
            }
            debug!("idle_sweeper=stopped");
        })
    }

    /// Serve drain requests raised by registry status transitions.
    pub fn spawn_drain_listener(
        &self,
        mut requests: UnboundedReceiver<DrainRequest>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let timeout = self.inner.settings.close_timeout;
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = token.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                let manager = manager.clone();
                tokio::spawn(async move {
                    match manager
                        .close(request.tenant_id, CloseOptions::graceful(timeout))
                        .await
                    {
                        Ok(outcome) => info!(
                            tenant = %request.code,
                            status = %request.status,
                            ?outcome,
                            "drain=served"
                        ),
                        Err(e) => warn!(tenant = %request.code, error = %e, "drain=failed"),
                    }
                });
            }
            debug!("drain_listener=stopped");
        })
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let mut entries: Vec<EntrySnapshot> =
            self.inner.entries.iter().map(|e| e.value().snapshot()).collect();
        entries.sort_by(|a, b| a.code.cmp(&b.code));
        entries
    }

    pub fn creation_lock_count(&self) -> usize {
        self.inner.creation_locks.len()
    }

    pub fn entry_state(&self, tenant_id: Uuid) -> Option<EntryState> {
        self.inner.entry(tenant_id).map(|e| e.state())
    }

    /// Pool of an OPEN entry for read-only sampling; does not count as use.
    pub fn sample_target(&self, tenant_id: Uuid) -> Option<(DatabaseConnection, ConnSpec)> {
        let entry = self.inner.entry(tenant_id)?;
        let conn = {
            let inner = entry.inner.lock();
            match (inner.state, &inner.conn) {
                (EntryState::Open, Some(conn)) => Some(conn.clone()),
                _ => None,
            }
        };
        conn.map(|conn| (conn, entry.spec.clone()))
    }

    pub fn counters(&self) -> PoolCountersSnapshot {
        self.inner.counters.snapshot()
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.inner.registry
    }

    pub fn settings(&self) -> &Arc<DatabaseSettings> {
        &self.inner.settings
    }
}
