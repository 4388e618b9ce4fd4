#[macro_use]
mod common;

use actix_web::http::StatusCode;
use actix_web::test;
use backend_test_support::problem_details::assert_problem;
use backend_test_support::TenancyFixture;
use serde_json::Value;

use common::{app_state, ADMIN};

#[actix_web::test]
async fn health_reports_the_shared_store() {
    let fixture = TenancyFixture::new();
    let (_core, data) = app_state(fixture.core().await);
    let app = admin_app!(data);

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["shared_db"], "ok");
    assert!(body.get("shared_db_error").is_none());
    assert_eq!(body["shared_schema"], "m20250901_000002_create_tenant_audit_log");
    assert_eq!(body["open_pools"], 0);
}

#[actix_web::test]
async fn inbound_request_id_becomes_the_trace_id() {
    let fixture = TenancyFixture::new();
    let (_core, data) = app_state(fixture.core().await);
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/migrations/tenant/GHOST/run")
        .insert_header(ADMIN)
        .insert_header(("x-request-id", "req-20251017-0001"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let echoed = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    assert_eq!(echoed.as_deref(), Some("req-20251017-0001"));

    let problem = assert_problem(resp, "TENANT_NOT_FOUND", StatusCode::NOT_FOUND).await;
    assert_eq!(problem.trace_id, "req-20251017-0001");
}

#[actix_web::test]
async fn unusable_request_ids_are_replaced() {
    let fixture = TenancyFixture::new();
    let (_core, data) = app_state(fixture.core().await);
    let app = admin_app!(data);

    let req = test::TestRequest::post()
        .uri("/admin/database/backup")
        .insert_header(("x-request-id", "not a usable id"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let echoed = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    assert_ne!(echoed, "not a usable id");
    assert!(uuid::Uuid::parse_str(&echoed).is_ok());

    // no admin subject: the extractor rejects before the handler runs
    let problem = assert_problem(resp, "UNAUTHORIZED", StatusCode::UNAUTHORIZED).await;
    assert_eq!(problem.trace_id, echoed);
}
