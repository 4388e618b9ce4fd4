use actix_web::error::ResponseError;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use db_infra::DbInfraError;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::errors::ErrorCode;
use crate::trace_ctx;

/// RFC 7807 body returned for every failed admin request.
#[derive(Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub trace_id: String,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {detail}")]
    BadRequest { code: ErrorCode, detail: String },
    #[error("Unauthorized: {detail}")]
    Unauthorized { detail: String },
    #[error("Not found: {detail}")]
    NotFound { code: ErrorCode, detail: String },
    #[error("Conflict: {detail}")]
    Conflict { code: ErrorCode, detail: String },
    #[error("Service unavailable: {detail}")]
    Unavailable { code: ErrorCode, detail: String },
    #[error("Timeout: {detail}")]
    Timeout { code: ErrorCode, detail: String },
    #[error("Not implemented: {detail}")]
    NotImplemented { detail: String },
    #[error("Internal error: {detail}")]
    Internal { code: ErrorCode, detail: String },
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::BadRequest { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Unavailable { code, .. }
            | AppError::Timeout { code, .. }
            | AppError::Internal { code, .. } => *code,
            AppError::Unauthorized { .. } => ErrorCode::Unauthorized,
            AppError::NotImplemented { .. } => ErrorCode::NotImplemented,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            AppError::BadRequest { detail, .. }
            | AppError::Unauthorized { detail }
            | AppError::NotFound { detail, .. }
            | AppError::Conflict { detail, .. }
            | AppError::Unavailable { detail, .. }
            | AppError::Timeout { detail, .. }
            | AppError::NotImplemented { detail }
            | AppError::Internal { detail, .. } => detail,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn bad_request(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            detail: detail.into(),
        }
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::Unauthorized {
            detail: detail.into(),
        }
    }

    pub fn not_implemented(detail: impl Into<String>) -> Self {
        Self::NotImplemented {
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            code: ErrorCode::Internal,
            detail: detail.into(),
        }
    }

    fn humanize_code(code: &str) -> String {
        code.split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    None => String::new(),
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn list_or_nothing(applied_this_run: &[String]) -> String {
    if applied_this_run.is_empty() {
        "nothing".to_string()
    } else {
        applied_this_run.join(", ")
    }
}

fn migration_failure_detail(
    tenant: &str,
    migration: &str,
    applied_this_run: &[String],
    message: &str,
) -> String {
    let before = list_or_nothing(applied_this_run);
    format!(
        "migration {migration} failed for tenant {tenant}: {message}; applied before it in this run: {before}"
    )
}

impl From<DbInfraError> for AppError {
    fn from(e: DbInfraError) -> Self {
        let detail = e.to_string();
        match e {
            DbInfraError::TenantNotFound { .. } => AppError::NotFound {
                code: ErrorCode::TenantNotFound,
                detail,
            },
            DbInfraError::TenantUnavailable { .. } => AppError::Conflict {
                code: ErrorCode::TenantUnavailable,
                detail,
            },
            DbInfraError::InvalidTransition { .. } => AppError::Conflict {
                code: ErrorCode::InvalidTransition,
                detail,
            },
            DbInfraError::DuplicateTenant { .. } => AppError::Conflict {
                code: ErrorCode::DuplicateTenant,
                detail,
            },
            DbInfraError::BackingStoreUnreachable { .. } => AppError::Unavailable {
                code: ErrorCode::BackingStoreUnreachable,
                detail,
            },
            DbInfraError::MigrationInProgress { .. } => AppError::Unavailable {
                code: ErrorCode::MigrationInProgress,
                detail,
            },
            DbInfraError::BackingStoreTimeout {
                migration: Some(migration),
                applied_this_run,
                ..
            } => AppError::Timeout {
                code: ErrorCode::BackingStoreTimeout,
                detail: format!(
                    "{detail}; migration {migration}; applied before it in this run: {}",
                    list_or_nothing(&applied_this_run)
                ),
            },
            DbInfraError::BackingStoreTimeout { .. } => AppError::Timeout {
                code: ErrorCode::BackingStoreTimeout,
                detail,
            },
            DbInfraError::MigrationFailed {
                tenant,
                migration,
                applied_this_run,
                message,
            } => AppError::Internal {
                code: ErrorCode::MigrationFailed,
                detail: migration_failure_detail(&tenant, &migration, &applied_this_run, &message),
            },
            DbInfraError::LedgerInconsistent { .. } => AppError::Internal {
                code: ErrorCode::LedgerInconsistent,
                detail,
            },
            DbInfraError::Config { .. } => AppError::Internal {
                code: ErrorCode::ConfigError,
                detail,
            },
            DbInfraError::Db(_) => AppError::Internal {
                code: ErrorCode::DbError,
                detail,
            },
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status();
        let code = self.code().as_str();
        let trace_id = trace_ctx::trace_id();

        if status.is_server_error() {
            error!(trace_id = %trace_id, code, detail = %self.detail(), "request failed");
        } else if status != StatusCode::NOT_FOUND {
            warn!(trace_id = %trace_id, code, detail = %self.detail(), "request rejected");
        }

        let problem_details = ProblemDetails {
            type_: format!("https://gestio.app/errors/{code}"),
            title: Self::humanize_code(code),
            status: status.as_u16(),
            detail: self.detail().to_string(),
            code: code.to_string(),
            trace_id: trace_id.clone(),
        };

        HttpResponse::build(status)
            .content_type("application/problem+json")
            .insert_header(("x-trace-id", trace_id))
            .json(problem_details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(e: DbInfraError) -> (StatusCode, &'static str) {
        let app = AppError::from(e);
        (app.status(), app.code().as_str())
    }

    #[test]
    fn core_errors_map_to_statuses() {
        let cases = [
            (
                DbInfraError::TenantNotFound {
                    tenant: "ACME".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                DbInfraError::unavailable("ACME", "status SUSPENDED"),
                StatusCode::CONFLICT,
            ),
            (
                DbInfraError::InvalidTransition {
                    tenant: "ACME".into(),
                    from: "ARCHIVED".into(),
                    to: "ACTIVE".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                DbInfraError::DuplicateTenant {
                    code: "ACME".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                DbInfraError::BackingStoreUnreachable {
                    tenant: "ACME".into(),
                    attempts: 5,
                    message: "refused".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                DbInfraError::MigrationInProgress {
                    tenant: "ACME".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                DbInfraError::timeout("ACME", "query", 5000),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                DbInfraError::LedgerInconsistent {
                    tenant: "ACME".into(),
                    detail: "gap".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                DbInfraError::config("bad"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            let core_code = err.code();
            let (got_status, got_code) = mapped(err);
            assert_eq!(got_status, status, "{core_code}");
            assert_eq!(got_code, core_code, "HTTP code mirrors the core code");
        }
    }

    #[test]
    fn migration_failure_detail_names_the_migration_and_prior_work() {
        let err = AppError::from(DbInfraError::MigrationFailed {
            tenant: "ACME".into(),
            migration: "m20250901_000003_create_invoices".into(),
            applied_this_run: vec![
                "m20250901_000001_create_clients".into(),
                "m20250901_000002_create_stock_items".into(),
            ],
            message: "syntax error".into(),
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), ErrorCode::MigrationFailed);
        let detail = err.detail();
        assert!(detail.contains("m20250901_000003_create_invoices"));
        assert!(detail.contains("m20250901_000002_create_stock_items"));
        assert!(detail.contains("ACME"));
    }

    #[test]
    fn migration_timeout_detail_keeps_prior_work() {
        let err = AppError::from(
            DbInfraError::timeout("ACME", "migration m20250901_000003_create_invoices", 500)
                .at_migration(
                    "ACME",
                    "m20250901_000003_create_invoices",
                    vec!["m20250901_000001_create_clients".into()],
                ),
        );
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code(), ErrorCode::BackingStoreTimeout);
        let detail = err.detail();
        assert!(detail.contains("m20250901_000003_create_invoices"));
        assert!(detail.contains("m20250901_000001_create_clients"));
    }

    #[test]
    fn titles_are_humanized_codes() {
        assert_eq!(
            AppError::humanize_code("MIGRATION_IN_PROGRESS"),
            "Migration In Progress"
        );
        assert_eq!(AppError::humanize_code("UNAUTHORIZED"), "Unauthorized");
    }
}
