#[macro_use]
mod common;

use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::test;
use backend_test_support::problem_details::assert_problem;
use backend_test_support::{seed_tenant, TenancyFixture};
use db_infra::TenantStatus;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::{app_state, ADMIN};

#[actix_web::test]
async fn register_then_list_and_fetch() {
    let fixture = TenancyFixture::new();
    let (_core, data) = app_state(fixture.core().await);
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/tenants")
        .insert_header(ADMIN)
        .set_json(json!({ "code": "acme-eu", "display_name": "Acme Europe" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = test::read_body_json(resp).await;
    assert_eq!(created["code"], "ACME-EU");
    assert_eq!(created["database_name"], "erp_acme_eu");
    assert_eq!(created["status"], "PROVISIONING");
    assert!(created["created_at"].as_str().is_some_and(|t| t.contains('T')));

    let req = test::TestRequest::post()
        .uri("/admin/database/tenants")
        .insert_header(ADMIN)
        .set_json(json!({ "code": "ACME-EU", "display_name": "Again" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_problem(resp, "DUPLICATE_TENANT", StatusCode::CONFLICT).await;

    let req = test::TestRequest::get()
        .uri("/admin/database/tenants?status=provisioning")
        .insert_header(ADMIN)
        .to_request();
    let list: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(list["tenants"].as_array().map(Vec::len), Some(1));

    let req = test::TestRequest::get()
        .uri("/admin/database/tenants?status=active")
        .insert_header(ADMIN)
        .to_request();
    let list: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(list["tenants"], json!([]));

    let req = test::TestRequest::get()
        .uri("/admin/database/tenants/acme-eu")
        .insert_header(ADMIN)
        .to_request();
    let fetched: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(fetched["id"], created["id"]);
}

#[actix_web::test]
async fn malformed_bodies_are_problem_responses() {
    let fixture = TenancyFixture::new();
    let (core, data) = app_state(fixture.core().await);
    seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/tenants/ACME/status")
        .insert_header(ADMIN)
        .insert_header(("content-type", "application/json"))
        .set_payload(r#"{"status": "#)
        .to_request();
    let resp = test::call_service(&app, req).await;
    let problem = assert_problem(resp, "BAD_REQUEST", StatusCode::BAD_REQUEST).await;
    assert!(problem.detail.starts_with("Invalid JSON"));

    let req = test::TestRequest::post()
        .uri("/admin/database/tenants/ACME/status")
        .insert_header(ADMIN)
        .set_json(json!({ "status": "DORMANT" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_problem(resp, "INVALID_STATUS", StatusCode::BAD_REQUEST).await;
}

#[actix_web::test]
async fn transitions_follow_the_lifecycle() {
    let fixture = TenancyFixture::new();
    let (core, data) = app_state(fixture.core().await);
    seed_tenant(&core, "ACME", TenantStatus::Active).await;
    let app = admin_app!(data);

    let transition = |status: &str| {
        test::TestRequest::post()
            .uri("/admin/database/tenants/ACME/status")
            .insert_header(ADMIN)
            .set_json(json!({ "status": status }))
            .to_request()
    };

    let archived: Value = test::call_and_read_body_json(&app, transition("archived")).await;
    assert_eq!(archived["status"], "ARCHIVED");

    let resp = test::call_service(&app, transition("ACTIVE")).await;
    let problem = assert_problem(resp, "INVALID_TRANSITION", StatusCode::CONFLICT).await;
    assert!(problem.detail.contains("ARCHIVED"));
}

#[actix_web::test]
async fn suspending_over_http_drains_the_pool() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TenancyFixture::new();
    let (core, data) = app_state(fixture.core().await);
    let token = CancellationToken::new();
    let tasks = core.spawn_background(token.clone());
    let acme = seed_tenant(&core, "ACME", TenantStatus::Active).await;
    core.pools().acquire(acme.id).await?.release();
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/tenants/ACME/status")
        .insert_header(ADMIN)
        .set_json(json!({ "status": "SUSPENDED" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "SUSPENDED");

    for _ in 0..150 {
        if core.pools().entry_state(acme.id).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(core.pools().entry_state(acme.id), None, "suspension drains the pool");

    let req = test::TestRequest::post()
        .uri("/admin/database/migrations/tenant/ACME/run")
        .insert_header(ADMIN)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_problem(resp, "TENANT_UNAVAILABLE", StatusCode::CONFLICT).await;

    token.cancel();
    for task in tasks {
        task.await?;
    }
    Ok(())
}
