#[macro_use]
mod common;

use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::test;
use backend_test_support::problem_details::assert_problem;
use backend_test_support::{
    scripted_catalog, seed_tenant, CountingConnector, ScriptedMigration, TenancyFixture,
};
use db_infra::entities::TenantAuditLog;
use db_infra::TenantStatus;
use sea_orm::EntityTrait;
use serde_json::Value;

use common::{app_state, ADMIN};

const M1: &str = "m20250101_000001_create_alpha";
const M2: &str = "m20250101_000002_create_beta";
const M3: &str = "m20250101_000003_create_gamma";

#[actix_web::test]
async fn privileged_routes_require_an_admin_subject() {
    let fixture = TenancyFixture::new();
    let (_core, data) = app_state(fixture.core().await);
    let app = admin_app!(data);

    let req = test::TestRequest::get()
        .uri("/admin/database/stats")
        .to_request();
    let resp = test::call_service(&app, req).await;
    let problem = assert_problem(resp, "UNAUTHORIZED", StatusCode::UNAUTHORIZED).await;
    assert!(problem.detail.contains("x-admin-subject"));
}

#[actix_web::test]
async fn stats_reports_registry_totals() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TenancyFixture::new();
    let (core, data) = app_state(fixture.core().await);
    seed_tenant(&core, "ACME", TenantStatus::Active).await;
    seed_tenant(&core, "HALT", TenantStatus::Suspended).await;
    let app = admin_app!(data);

    let req = test::TestRequest::get()
        .uri("/admin/database/stats")
        .insert_header(ADMIN)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(body["totals"]["tenants_by_status"]["ACTIVE"], 1);
    assert_eq!(body["totals"]["tenants_by_status"]["SUSPENDED"], 1);
    assert_eq!(body["shared"]["reachable"], true);
    assert!(body["per_tenant"].as_array().is_some());
    Ok(())
}

#[actix_web::test]
async fn run_applies_pending_migrations_and_is_audited() -> Result<(), Box<dyn std::error::Error>>
{
    let fixture = TenancyFixture::new();
    let (core, data) = app_state(fixture.core().await);
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let app = admin_app!(data);

    let run = || {
        test::TestRequest::post()
            .uri("/admin/database/migrations/tenant/acme/run")
            .insert_header(ADMIN)
            .to_request()
    };

    let first: Value = test::call_and_read_body_json(&app, run()).await;
    assert_eq!(first["code"], "ACME");
    assert_eq!(first["applied_this_run"].as_array().map(Vec::len), Some(3));

    let second: Value = test::call_and_read_body_json(&app, run()).await;
    assert_eq!(second["applied_this_run"], serde_json::json!([]));

    let req = test::TestRequest::get()
        .uri("/admin/database/migrations/tenant/ACME/status")
        .insert_header(ADMIN)
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["applied"].as_array().map(Vec::len), Some(3));
    assert_eq!(status["pending"], serde_json::json!([]));
    assert!(status["applied"][0]["applied_at"].is_string());

    let audit = TenantAuditLog::find().all(core.registry().shared()).await?;
    assert_eq!(audit.len(), 2);
    assert!(audit
        .iter()
        .all(|row| row.tenant_id == acme.id && row.action == "migrations.run"));
    assert_eq!(audit[0].actor, "ops@example.com");
    Ok(())
}

#[actix_web::test]
async fn tenant_errors_carry_their_kind() {
    let fixture = TenancyFixture::new();
    let (core, data) = app_state(fixture.core().await);
    seed_tenant(&core, "HALT", TenantStatus::Suspended).await;
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/migrations/tenant/NOPE/run")
        .insert_header(ADMIN)
        .to_request();
    let resp = test::call_service(&app, req).await;
    let problem = assert_problem(resp, "TENANT_NOT_FOUND", StatusCode::NOT_FOUND).await;
    assert!(problem.detail.contains("NOPE"));

    let req = test::TestRequest::post()
        .uri("/admin/database/migrations/tenant/HALT/run")
        .insert_header(ADMIN)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_problem(resp, "TENANT_UNAVAILABLE", StatusCode::CONFLICT).await;
}

#[actix_web::test]
async fn failed_migration_names_the_migration_and_prior_work() {
    let fixture = TenancyFixture::new();
    let connector = CountingConnector::new(&fixture.settings);
    let catalog = scripted_catalog(vec![
        ScriptedMigration::creates(M1, "alpha"),
        ScriptedMigration::fails_after_creating(M2, "beta"),
        ScriptedMigration::creates(M3, "gamma"),
    ]);
    let (core, data) = app_state(fixture.core_with(connector, Some(catalog)).await);
    seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/migrations/tenant/ACME/run")
        .insert_header(ADMIN)
        .to_request();
    let resp = test::call_service(&app, req).await;
    let problem =
        assert_problem(resp, "MIGRATION_FAILED", StatusCode::INTERNAL_SERVER_ERROR).await;
    assert!(problem.detail.contains(M2), "{}", problem.detail);
    assert!(problem.detail.contains(M1), "{}", problem.detail);
    assert!(problem.type_.ends_with("/MIGRATION_FAILED"));
    assert_eq!(problem.title, "Migration Failed");
}

#[actix_web::test]
async fn concurrent_runs_answer_migration_in_progress() {
    let fixture = TenancyFixture::new();
    let connector = CountingConnector::new(&fixture.settings);
    let catalog = scripted_catalog(vec![ScriptedMigration::slow(
        M1,
        "alpha",
        Duration::from_millis(300),
    )]);
    let (core, data) = app_state(fixture.core_with(connector, Some(catalog)).await);
    seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let app = admin_app!(data);

    let run = || {
        test::TestRequest::post()
            .uri("/admin/database/migrations/tenant/ACME/run")
            .insert_header(ADMIN)
            .to_request()
    };
    let (a, b) = tokio::join!(
        test::call_service(&app, run()),
        test::call_service(&app, run())
    );

    let (ok, busy) = if a.status() == StatusCode::OK {
        (a, b)
    } else {
        (b, a)
    };
    assert_eq!(ok.status(), StatusCode::OK);
    assert_problem(busy, "MIGRATION_IN_PROGRESS", StatusCode::SERVICE_UNAVAILABLE).await;
}

#[actix_web::test]
async fn run_all_reports_partial_failure_as_multi_status() -> Result<(), Box<dyn std::error::Error>>
{
    let fixture = TenancyFixture::new();
    let connector = CountingConnector::new(&fixture.settings);
    let catalog = scripted_catalog(vec![
        ScriptedMigration::creates(M1, "alpha"),
        ScriptedMigration::creates(M2, "beta"),
    ]);
    let (core, data) = app_state(fixture.core_with(connector, Some(catalog)).await);
    seed_tenant(&core, "GOOD", TenantStatus::Active).await;
    let bad = seed_tenant(&core, "BAD", TenantStatus::Active).await;
    seed_tenant(&core, "TRY", TenantStatus::Trial).await;
    {
        let handle = core.pools().acquire(bad.id).await?;
        sea_orm::ConnectionTrait::execute_unprepared(
            handle.connection(),
            "CREATE TABLE beta (id INTEGER PRIMARY KEY)",
        )
        .await?;
    }
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/migrations/run-all")
        .insert_header(ADMIN)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["filter"], "ACTIVE");
    assert_eq!((body["succeeded"].as_u64(), body["failed"].as_u64()), (Some(1), Some(1)));
    assert_eq!(body["results"]["GOOD"]["result"], "SUCCEEDED");
    assert_eq!(body["results"]["BAD"]["result"], "FAILED");
    assert_eq!(body["results"]["BAD"]["migration"], M2);
    assert!(body["results"].get("TRY").is_none());

    let req = test::TestRequest::post()
        .uri("/admin/database/migrations/run-all?status=trial")
        .insert_header(ADMIN)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["results"]["TRY"]["applied_this_run"], serde_json::json!([M1, M2]));

    let req = test::TestRequest::post()
        .uri("/admin/database/migrations/run-all?status=dormant")
        .insert_header(ADMIN)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_problem(resp, "INVALID_STATUS", StatusCode::BAD_REQUEST).await;
    Ok(())
}

#[actix_web::test]
async fn close_reports_drained_and_forced_outcomes() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TenancyFixture::new();
    let (core, data) = app_state(fixture.core().await);
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let app = admin_app!(data);

    let close = |query: &str| {
        test::TestRequest::post()
            .uri(&format!("/admin/database/connections/tenant/ACME/close{query}"))
            .insert_header(ADMIN)
            .to_request()
    };

    let body: Value = test::call_and_read_body_json(&app, close("")).await;
    assert_eq!(body["tenant"], "ACME");
    assert_eq!(body["outcome"], "NOT_OPEN");

    core.pools().acquire(acme.id).await?.release();
    let body: Value = test::call_and_read_body_json(&app, close("?timeout_ms=500")).await;
    assert_eq!(body["outcome"], "DRAINED");

    let held = core.pools().acquire(acme.id).await?;
    let resp = test::call_service(&app, close("?graceful=false")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["outcome"], "FORCED_TERMINATION");
    assert_eq!(body["abandoned_in_flight"], 1);
    drop(held);

    let resp = test::call_service(&app, close("?graceful=maybe")).await;
    assert_problem(resp, "BAD_REQUEST", StatusCode::BAD_REQUEST).await;
    Ok(())
}

#[actix_web::test]
async fn synchronize_is_idempotent_after_bootstrap() {
    let fixture = TenancyFixture::new();
    let (_core, data) = app_state(fixture.core().await);
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/synchronize")
        .insert_header(ADMIN)
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["database_name"], "erp_shared");
    assert_eq!(body["applied_this_run"], serde_json::json!([]));
}

#[actix_web::test]
async fn backup_is_not_implemented() {
    let fixture = TenancyFixture::new();
    let (_core, data) = app_state(fixture.core().await);
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/backup")
        .insert_header(ADMIN)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_problem(resp, "NOT_IMPLEMENTED", StatusCode::NOT_IMPLEMENTED).await;
}
