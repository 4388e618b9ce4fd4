use actix_web::{web, HttpResponse};
use db_infra::Tenant;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{audit, parse_status, parse_status_filter};
use crate::error::AppError;
use crate::extractors::{AdminIdentity, ValidatedJson, ValidatedQuery};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct TenantList {
    tenants: Vec<Tenant>,
}

async fn list_tenants(
    _admin: AdminIdentity,
    app_state: web::Data<AppState>,
    query: ValidatedQuery<ListQuery>,
) -> Result<HttpResponse, AppError> {
    let filter = parse_status_filter(query.status.as_deref())?;
    let tenants = app_state.core().registry().list(filter).await?;
    Ok(HttpResponse::Ok().json(TenantList { tenants }))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    code: String,
    display_name: String,
}

async fn register_tenant(
    admin: AdminIdentity,
    app_state: web::Data<AppState>,
    body: ValidatedJson<RegisterRequest>,
) -> Result<HttpResponse, AppError> {
    let core = app_state.core();
    let body = body.into_inner();
    let tenant = core
        .registry()
        .register(&body.code, &body.display_name)
        .await?;
    audit(core, &admin, &tenant, "tenant.register").await;
    Ok(HttpResponse::Created().json(tenant))
}

async fn get_tenant(
    _admin: AdminIdentity,
    app_state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let tenant = app_state
        .core()
        .registry()
        .resolve(&path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(tenant))
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    status: String,
}

/// Moving to SUSPENDED or ARCHIVED also drains the tenant's pool through the
/// background drain listener.
async fn transition_tenant(
    admin: AdminIdentity,
    app_state: web::Data<AppState>,
    path: web::Path<String>,
    body: ValidatedJson<TransitionRequest>,
) -> Result<HttpResponse, AppError> {
    let core = app_state.core();
    let next = parse_status(&body.status)?;
    let tenant = core.registry().resolve(&path.into_inner()).await?;

    let updated = core.registry().transition_status(tenant.id, next).await?;
    info!(
        tenant_code = %updated.code,
        from = %tenant.status,
        to = %updated.status,
        "tenant status changed"
    );
    audit(core, &admin, &updated, &format!("tenant.status:{next}")).await;
    Ok(HttpResponse::Ok().json(updated))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/tenants", web::get().to(list_tenants))
        .route("/tenants", web::post().to(register_tenant))
        .route("/tenants/{code}", web::get().to(get_tenant))
        .route("/tenants/{code}/status", web::post().to(transition_tenant));
}
