mod common;

use std::time::Duration;

use backend_test_support::{seed_tenant, TenancyFixture};
use db_infra::{DbInfraError, EntryState, TenantStatus};

#[tokio::test]
async fn snapshot_reports_open_pools_and_registry_totals() -> Result<(), Box<dyn std::error::Error>>
{
    let fixture = TenancyFixture::new();
    let core = fixture.core().await;
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;
    seed_tenant(&core, "HALT", TenantStatus::Suspended).await;

    core.migrations().run(acme.id).await?;
    let held = core.pools().acquire(acme.id).await?;

    let snapshot = core.stats().snapshot().await;
    assert_eq!(snapshot.per_tenant.len(), 1);
    let row = &snapshot.per_tenant[0];
    assert_eq!(row.code, "ACME");
    assert_eq!(row.database_name, "erp_acme");
    assert_eq!(row.state, EntryState::Open);
    assert_eq!(row.in_flight, 1);
    assert!(!row.degraded, "{:?}", row.error);
    assert!(row.size_bytes.unwrap_or_default() > 0);
    // the ledger holds one row per applied migration
    assert_eq!(row.row_estimate, Some(3));

    let totals = &snapshot.totals;
    assert_eq!((totals.pools, totals.open, totals.degraded), (1, 1, 0));
    assert_eq!(totals.in_flight, 1);
    assert_eq!(totals.tenants_by_status["ACTIVE"], 1);
    assert_eq!(totals.tenants_by_status["SUSPENDED"], 1);
    assert_eq!(totals.migration_counters.migrations_applied, 3);
    assert!(snapshot.shared.reachable);

    drop(held);
    Ok(())
}

#[tokio::test]
async fn snapshot_does_not_open_pools() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TenancyFixture::new();
    let core = fixture.core().await;
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;

    let snapshot = core.stats().snapshot().await;
    assert!(snapshot.per_tenant.is_empty());
    assert_eq!(core.pools().entry_state(acme.id), None);
    assert_eq!(core.pools().counters().pools_opened, 0);

    let json = serde_json::to_value(&snapshot)?;
    assert!(json["totals"]["pool_counters"].is_object());
    Ok(())
}

#[tokio::test]
async fn shared_sync_is_idempotent_and_serialized() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TenancyFixture::new();
    let core = fixture.core().await;
    let sync = core.shared_sync();

    // bootstrap already synchronized the shared store
    let report = sync.synchronize().await?;
    assert_eq!(report.database_name, "erp_shared");
    assert!(report.applied_this_run.is_empty());

    let (a, b) = tokio::join!(sync.synchronize(), sync.synchronize());
    let rejected = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(DbInfraError::MigrationInProgress { .. })))
        .count();
    assert_eq!(rejected, 1);
    assert!(a.is_ok() || b.is_ok());
    Ok(())
}

#[tokio::test]
async fn bootstrap_without_sync_fails_fast_on_an_empty_shared_store() {
    let fixture = TenancyFixture::new().configure(|s| {
        s.sync_shared_on_startup = false;
        s.statement_timeout = Duration::from_secs(1);
    });
    let core = fixture.core().await;

    let err = core.registry().list(None).await.unwrap_err();
    assert!(matches!(err, DbInfraError::Db(_)), "{err}");
}

#[tokio::test]
async fn in_memory_deployment_keeps_the_shared_store_alive() -> Result<(), Box<dyn std::error::Error>>
{
    let fixture = TenancyFixture::new().configure(|s| {
        s.db_kind = db_infra::DbKind::SqliteMemory;
        s.shared_db = format!("shared_{}", uuid::Uuid::new_v4().simple());
    });
    let core = fixture.core().await;
    let tenant = seed_tenant(&core, "MEM", TenantStatus::Active).await;

    let report = core.migrations().run(tenant.id).await?;
    assert_eq!(report.applied_this_run.len(), 3);
    assert_eq!(core.registry().resolve("mem").await?.id, tenant.id);
    Ok(())
}
