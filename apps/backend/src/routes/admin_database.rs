//! `/admin/database/*`: stats, shared-store synchronization, per-tenant
//! migrations and connection management.

use std::collections::BTreeMap;
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use db_infra::{CloseOptions, CloseOutcome, TenantRunResult, TenantStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{audit, parse_status_filter};
use crate::error::AppError;
use crate::extractors::{AdminIdentity, ValidatedQuery};
use crate::state::AppState;

async fn stats(
    _admin: AdminIdentity,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let snapshot = app_state.core().stats().snapshot().await;
    Ok(HttpResponse::Ok().json(snapshot))
}

async fn synchronize(
    admin: AdminIdentity,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    info!(admin = %admin.subject, action = "shared.synchronize", "admin_action");
    let report = app_state.core().shared_sync().synchronize().await?;
    Ok(HttpResponse::Ok().json(report))
}

async fn migration_status(
    _admin: AdminIdentity,
    app_state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let core = app_state.core();
    let tenant = core.registry().resolve(&path.into_inner()).await?;
    let status = core.migrations().status(tenant.id).await?;
    Ok(HttpResponse::Ok().json(status))
}

async fn run_migrations(
    admin: AdminIdentity,
    app_state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let core = app_state.core();
    let tenant = core.registry().resolve(&path.into_inner()).await?;
    audit(core, &admin, &tenant, "migrations.run").await;

    let report = core.migrations().run(tenant.id).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[derive(Debug, Deserialize)]
struct RunAllQuery {
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunAllResponse {
    filter: String,
    succeeded: usize,
    failed: usize,
    results: BTreeMap<String, TenantRunResult>,
}

/// Runs every matching tenant (ACTIVE unless `status` says otherwise). Any
/// per-tenant failure turns the response into 207 so partial failure is
/// never reported as plain success.
async fn run_all(
    admin: AdminIdentity,
    app_state: web::Data<AppState>,
    query: ValidatedQuery<RunAllQuery>,
) -> Result<HttpResponse, AppError> {
    let filter = match query.status.as_deref() {
        None => Some(TenantStatus::Active),
        raw => parse_status_filter(raw)?,
    };
    info!(
        admin = %admin.subject,
        action = "migrations.run_all",
        filter = ?filter,
        "admin_action"
    );

    let results = app_state.core().migrations().run_all(filter).await?;
    let failed = results.values().filter(|r| !r.is_success()).count();
    let body = RunAllResponse {
        filter: filter.map_or_else(|| "ALL".to_string(), |s| s.to_string()),
        succeeded: results.len() - failed,
        failed,
        results,
    };

    let status = if failed == 0 {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok(HttpResponse::build(status).json(body))
}

#[derive(Debug, Deserialize)]
struct CloseQuery {
    graceful: Option<bool>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CloseResponse {
    tenant: String,
    #[serde(flatten)]
    outcome: CloseOutcome,
}

/// Graceful by default, with the configured close timeout, capped at the
/// configured maximum. A forced close, or a graceful one that timed out, still
/// answers 200 with a `FORCED_TERMINATION` outcome.
async fn close_connections(
    admin: AdminIdentity,
    app_state: web::Data<AppState>,
    path: web::Path<String>,
    query: ValidatedQuery<CloseQuery>,
) -> Result<HttpResponse, AppError> {
    let core = app_state.core();
    let tenant = core.registry().resolve(&path.into_inner()).await?;

    let opts = if query.graceful.unwrap_or(true) {
        let timeout = query
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(core.settings().close_timeout);
        CloseOptions::graceful(timeout)
    } else {
        CloseOptions::forced()
    };
    audit(core, &admin, &tenant, "connections.close").await;

    let outcome = core.pools().close(tenant.id, opts).await?;
    if matches!(outcome, CloseOutcome::ForcedTermination { .. }) {
        warn!(tenant_code = %tenant.code, outcome = ?outcome, "close ended in forced termination");
    }
    Ok(HttpResponse::Ok().json(CloseResponse {
        tenant: tenant.code,
        outcome,
    }))
}

/// Backups are taken by external tooling.
async fn backup(admin: AdminIdentity) -> Result<HttpResponse, AppError> {
    info!(admin = %admin.subject, action = "backup", "admin_action");
    Err(AppError::not_implemented(
        "backups are handled by external tooling, not by this service",
    ))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/stats", web::get().to(stats))
        .route("/synchronize", web::post().to(synchronize))
        .route(
            "/migrations/tenant/{code}/status",
            web::get().to(migration_status),
        )
        .route("/migrations/tenant/{code}/run", web::post().to(run_migrations))
        .route("/migrations/run-all", web::post().to(run_all))
        .route(
            "/connections/tenant/{code}/close",
            web::post().to(close_connections),
        )
        .route("/backup", web::post().to(backup));
}
