use actix_web::{web, HttpResponse};
use sea_orm::{ConnectionTrait, Statement};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    app_version: &'static str,
    shared_db: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    shared_db_error: Option<String>,
    shared_schema: String,
    open_pools: usize,
    time: String,
}

/// Liveness plus a cheap shared-store round trip. Always 200: the body says
/// whether the shared store answered.
async fn health(app_state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let core = app_state.core();
    let shared = core.registry().shared();

    let time = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string());

    let check = shared
        .query_one(Statement::from_string(
            shared.get_database_backend(),
            "SELECT 1 AS health_check",
        ))
        .await;
    let (shared_db, shared_db_error) = match check {
        Ok(_) => ("ok", None),
        Err(e) => ("error", Some(format!("shared store query failed: {e}"))),
    };

    let shared_schema = core
        .shared_sync()
        .catalog()
        .descriptors()
        .last()
        .map(|d| d.name.clone())
        .unwrap_or_else(|| "no_migrations".to_string());

    Ok(HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        app_version: env!("CARGO_PKG_VERSION"),
        shared_db,
        shared_db_error,
        shared_schema,
        open_pools: core.pools().snapshot().len(),
        time,
    }))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("", web::get().to(health));
}
