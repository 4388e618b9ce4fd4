//! Error codes for the administrative API.
//!
//! Add new codes here; never pass ad-hoc strings as error codes. Codes are
//! SCREAMING_SNAKE_CASE and appear verbatim in problem+json bodies. Codes that
//! originate in the tenancy core use the same strings as
//! `DbInfraError::code()`, so the HTTP surface and the CLI report identical
//! kinds.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Caller
    /// Upstream-authenticated admin identity missing
    Unauthorized,
    /// Malformed body, query or path
    BadRequest,
    /// Unknown tenant status value
    InvalidStatus,

    // Tenancy core
    TenantNotFound,
    TenantUnavailable,
    InvalidTransition,
    DuplicateTenant,
    BackingStoreUnreachable,
    BackingStoreTimeout,
    MigrationFailed,
    MigrationInProgress,
    LedgerInconsistent,

    // System
    /// Database error without a more specific classification
    DbError,
    ConfigError,
    /// Operation delegated to an external collaborator
    NotImplemented,
    Internal,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 16] = [
        ErrorCode::Unauthorized,
        ErrorCode::BadRequest,
        ErrorCode::InvalidStatus,
        ErrorCode::TenantNotFound,
        ErrorCode::TenantUnavailable,
        ErrorCode::InvalidTransition,
        ErrorCode::DuplicateTenant,
        ErrorCode::BackingStoreUnreachable,
        ErrorCode::BackingStoreTimeout,
        ErrorCode::MigrationFailed,
        ErrorCode::MigrationInProgress,
        ErrorCode::LedgerInconsistent,
        ErrorCode::DbError,
        ErrorCode::ConfigError,
        ErrorCode::NotImplemented,
        ErrorCode::Internal,
    ];

    /// The exact string that appears in HTTP responses.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::InvalidStatus => "INVALID_STATUS",

            Self::TenantNotFound => "TENANT_NOT_FOUND",
            Self::TenantUnavailable => "TENANT_UNAVAILABLE",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::DuplicateTenant => "DUPLICATE_TENANT",
            Self::BackingStoreUnreachable => "BACKING_STORE_UNREACHABLE",
            Self::BackingStoreTimeout => "BACKING_STORE_TIMEOUT",
            Self::MigrationFailed => "MIGRATION_FAILED",
            Self::MigrationInProgress => "MIGRATION_IN_PROGRESS",
            Self::LedgerInconsistent => "LEDGER_INCONSISTENT",

            Self::DbError => "DB_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
