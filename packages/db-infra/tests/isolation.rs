mod common;

use std::time::Duration;

use backend_test_support::{seed_tenant, TenancyFixture};
use db_infra::entities::TenantAuditLog;
use db_infra::{DbInfraError, TenantStatus};
use sea_orm::EntityTrait;

fn single_connection_fixture() -> TenancyFixture {
    // one shared-store connection, so every scope reuses the same session
    TenancyFixture::new().configure(|s| {
        s.pool.pool_min = 1;
        s.pool.pool_max = 1;
    })
}

#[tokio::test]
async fn context_is_visible_inside_the_scope_only() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = single_connection_fixture();
    let core = fixture.core().await;
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let globex = seed_tenant(&core, "GLOBEX", TenantStatus::Active).await;
    let isolation = core.isolation();
    let shared = core.registry().shared();

    let reader = isolation.clone();
    let seen = isolation
        .with_tenant_context(shared, acme.id, move |txn| {
            Box::pin(async move { reader.current_context(txn).await })
        })
        .await?;
    assert_eq!(seen, Some(acme.id.to_string()));
    assert_eq!(isolation.current_context(shared).await?, None);

    let reader = isolation.clone();
    let seen = isolation
        .with_tenant_context(shared, globex.id, move |txn| {
            Box::pin(async move { reader.current_context(txn).await })
        })
        .await?;
    assert_eq!(seen, Some(globex.id.to_string()));
    assert_eq!(isolation.current_context(shared).await?, None);
    Ok(())
}

#[tokio::test]
async fn context_is_cleared_when_the_scope_fails() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = single_connection_fixture();
    let core = fixture.core().await;
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let isolation = core.isolation();
    let shared = core.registry().shared();

    let result: Result<(), DbInfraError> = isolation
        .with_tenant_context(shared, acme.id, |_txn| {
            Box::pin(async move { Err(DbInfraError::config("scope failed")) })
        })
        .await;
    assert!(matches!(result, Err(DbInfraError::Config { .. })));
    assert_eq!(isolation.current_context(shared).await?, None);
    Ok(())
}

#[tokio::test]
async fn context_is_cleared_when_the_scope_is_cancelled() -> Result<(), Box<dyn std::error::Error>>
{
    let fixture = single_connection_fixture();
    let core = fixture.core().await;
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let isolation = core.isolation();
    let shared = core.registry().shared();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        isolation.with_tenant_context(shared, acme.id, |_txn| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
        }),
    )
    .await;
    assert!(cancelled.is_err());

    assert_eq!(isolation.current_context(shared).await?, None);
    Ok(())
}

#[tokio::test]
async fn admin_actions_are_recorded_under_the_tenant_context(
) -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TenancyFixture::new();
    let core = fixture.core().await;
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;

    core.record_admin_action(acme.id, "ops@example.com", "migrations.run")
        .await?;

    let rows = TenantAuditLog::find().all(core.registry().shared()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].tenant_id, acme.id);
    assert_eq!(rows[0].actor, "ops@example.com");
    assert_eq!(rows[0].action, "migrations.run");
    Ok(())
}

#[tokio::test]
async fn sqlite_reports_no_unenforced_tables() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TenancyFixture::new().configure(|s| {
        s.isolation.restricted_tables = vec!["tenant_audit_log".to_string()];
    });
    let core = fixture.core().await;

    let missing = core
        .isolation()
        .unenforced_tables(core.registry().shared())
        .await?;
    assert!(missing.is_empty());
    Ok(())
}
