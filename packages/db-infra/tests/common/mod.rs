#![allow(dead_code)]

use std::time::Duration;

use db_infra::{EntryState, TenancyCore};
use sea_orm::{ConnectionTrait, DatabaseBackend, Statement};
use uuid::Uuid;

#[ctor::ctor]
fn init_logging() {
    backend_test_support::logging::init();
}

/// Poll until the tenant's pool entry reaches `expected` (None = removed).
pub async fn wait_for_entry(core: &TenancyCore, tenant_id: Uuid, expected: Option<EntryState>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while core.pools().entry_state(tenant_id) != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "entry never reached {expected:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn table_exists<C: ConnectionTrait>(conn: &C, table: &str) -> bool {
    let row = conn
        .query_one(Statement::from_sql_and_values(
            DatabaseBackend::Sqlite,
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?",
            vec![table.into()],
        ))
        .await
        .expect("query sqlite_master")
        .expect("count row");
    row.try_get::<i64>("", "n").expect("count column") > 0
}
