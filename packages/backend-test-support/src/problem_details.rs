//! Assertions for `application/problem+json` error responses.

use actix_web::body::BoxBody;
use actix_web::dev::ServiceResponse;
use actix_web::http::StatusCode;
use serde::Deserialize;

/// Mirror of the backend's problem body, decoupled from backend types.
#[derive(Debug, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub trace_id: String,
}

/// Check status, error code and trace-id parity, then hand back the body for
/// further assertions.
pub async fn assert_problem(
    resp: ServiceResponse<BoxBody>,
    expected_code: &str,
    expected_status: StatusCode,
) -> Problem {
    assert_eq!(resp.status(), expected_status);

    let header_trace = resp
        .headers()
        .get("x-trace-id")
        .expect("x-trace-id header should be present")
        .to_str()
        .expect("x-trace-id header should be ASCII")
        .to_string();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(
        content_type.starts_with("application/problem+json"),
        "unexpected content type {content_type}"
    );

    let body = actix_web::test::read_body(resp).await;
    let problem: Problem =
        serde_json::from_slice(&body).expect("body should be problem+json");

    assert_eq!(problem.trace_id, header_trace, "body trace_id must match header");
    assert_eq!(problem.code, expected_code);
    assert_eq!(problem.status, expected_status.as_u16());
    problem
}
