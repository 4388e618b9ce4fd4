use std::str::FromStr;

use actix_web::web;
use db_infra::{Tenant, TenantStatus, TenancyCore};
use tracing::{info, warn};

use crate::error::AppError;
use crate::errors::ErrorCode;
use crate::extractors::AdminIdentity;

pub mod admin_database;
pub mod admin_tenants;
pub mod health;

/// Register every route. `main.rs` wraps the same configuration with the
/// tracing and logging middleware; tests call it directly.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/health").configure(health::configure_routes));
    cfg.service(
        web::scope("/admin/database")
            .configure(admin_database::configure_routes)
            .configure(admin_tenants::configure_routes),
    );
}

/// `None` for a missing value or `ALL`; otherwise a known status.
pub(crate) fn parse_status_filter(raw: Option<&str>) -> Result<Option<TenantStatus>, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(all) if all.eq_ignore_ascii_case("all") => Ok(None),
        Some(value) => parse_status(value).map(Some),
    }
}

pub(crate) fn parse_status(raw: &str) -> Result<TenantStatus, AppError> {
    TenantStatus::from_str(raw).map_err(|e| AppError::bad_request(ErrorCode::InvalidStatus, e))
}

/// Log a privileged action and append it to the tenant's audit trail. A
/// failed audit write is logged, never surfaced: the action itself decides
/// the response.
pub(crate) async fn audit(
    core: &TenancyCore,
    admin: &AdminIdentity,
    tenant: &Tenant,
    action: &str,
) {
    info!(
        admin = %admin.subject,
        tenant_id = %tenant.id,
        tenant_code = %tenant.code,
        action,
        "admin_action"
    );
    if let Err(e) = core
        .record_admin_action(tenant.id, &admin.subject, action)
        .await
    {
        warn!(
            tenant_code = %tenant.code,
            action,
            error = %e,
            "admin action not recorded"
        );
    }
}
