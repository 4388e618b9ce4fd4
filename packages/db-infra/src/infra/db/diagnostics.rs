//! Per-instance operational counters, read back through the stats snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    pools_opened: AtomicU64,
    pools_closed: AtomicU64,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    acquires: AtomicU64,
    acquires_rejected: AtomicU64,
    creation_waits: AtomicU64,
    forced_terminations: AtomicU64,
    idle_evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCountersSnapshot {
    pub pools_opened: u64,
    pub pools_closed: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub acquires: u64,
    pub acquires_rejected: u64,
    pub creation_waits: u64,
    pub forced_terminations: u64,
    pub idle_evictions: u64,
}

impl PoolCounters {
    pub fn pool_opened(&self) {
        bump(&self.pools_opened);
    }

    pub fn pool_closed(&self) {
        bump(&self.pools_closed);
    }

    pub fn connect_attempt(&self) {
        bump(&self.connect_attempts);
    }

    pub fn connect_failure(&self) {
        bump(&self.connect_failures);
    }

    pub fn acquired(&self) {
        bump(&self.acquires);
    }

    pub fn acquire_rejected(&self) {
        bump(&self.acquires_rejected);
    }

    pub fn creation_wait(&self) {
        bump(&self.creation_waits);
    }

    pub fn forced_termination(&self) {
        bump(&self.forced_terminations);
    }

    pub fn idle_eviction(&self) {
        bump(&self.idle_evictions);
    }

    pub fn snapshot(&self) -> PoolCountersSnapshot {
        PoolCountersSnapshot {
            pools_opened: read(&self.pools_opened),
            pools_closed: read(&self.pools_closed),
            connect_attempts: read(&self.connect_attempts),
            connect_failures: read(&self.connect_failures),
            acquires: read(&self.acquires),
            acquires_rejected: read(&self.acquires_rejected),
            creation_waits: read(&self.creation_waits),
            forced_terminations: read(&self.forced_terminations),
            idle_evictions: read(&self.idle_evictions),
        }
    }
}

#[derive(Debug, Default)]
pub struct MigrationCounters {
    runs_started: AtomicU64,
    runs_rejected: AtomicU64,
    migrations_applied: AtomicU64,
    migrations_skipped: AtomicU64,
    migrations_failed: AtomicU64,
    body_timeouts: AtomicU64,
    ledger_inconsistencies: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationCountersSnapshot {
    pub runs_started: u64,
    pub runs_rejected: u64,
    pub migrations_applied: u64,
    pub migrations_skipped: u64,
    pub migrations_failed: u64,
    pub body_timeouts: u64,
    pub ledger_inconsistencies: u64,
}

impl MigrationCounters {
    pub fn run_started(&self) {
        bump(&self.runs_started);
    }

    pub fn run_rejected(&self) {
        bump(&self.runs_rejected);
    }

    pub fn migration_applied(&self) {
        bump(&self.migrations_applied);
    }

    pub fn migration_skipped(&self) {
        bump(&self.migrations_skipped);
    }

    pub fn migration_failed(&self) {
        bump(&self.migrations_failed);
    }

    pub fn body_timeout(&self) {
        bump(&self.body_timeouts);
    }

    pub fn ledger_inconsistent(&self) {
        bump(&self.ledger_inconsistencies);
    }

    pub fn snapshot(&self) -> MigrationCountersSnapshot {
        MigrationCountersSnapshot {
            runs_started: read(&self.runs_started),
            runs_rejected: read(&self.runs_rejected),
            migrations_applied: read(&self.migrations_applied),
            migrations_skipped: read(&self.migrations_skipped),
            migrations_failed: read(&self.migrations_failed),
            body_timeouts: read(&self.body_timeouts),
            ledger_inconsistencies: read(&self.ledger_inconsistencies),
        }
    }

    pub fn log_snapshot(&self, context: &str) {
        let s = self.snapshot();
        info!(
            context,
            runs_started = s.runs_started,
            runs_rejected = s.runs_rejected,
            migrations_applied = s.migrations_applied,
            migrations_skipped = s.migrations_skipped,
            migrations_failed = s.migrations_failed,
            body_timeouts = s.body_timeouts,
            ledger_inconsistencies = s.ledger_inconsistencies,
            "migration_counters"
        );
    }
}
