use thiserror::Error;

/// Errors surfaced by the tenancy core.
///
/// Variants carry the tenant (code or identifier) and, where relevant, the
/// migration involved so the administrative surface can report them verbatim.
#[derive(Debug, Error)]
pub enum DbInfraError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("tenant not found: {tenant}")]
    TenantNotFound { tenant: String },

    #[error("tenant {tenant} is unavailable: {reason}")]
    TenantUnavailable { tenant: String, reason: String },

    #[error("backing store for {tenant} unreachable after {attempts} attempt(s): {message}")]
    BackingStoreUnreachable {
        tenant: String,
        attempts: u32,
        message: String,
    },

    #[error("backing store for {tenant} timed out after {timeout_ms}ms during {operation}")]
    BackingStoreTimeout {
        tenant: String,
        operation: String,
        timeout_ms: u64,
        /// Set when the deadline expired inside a migration run.
        migration: Option<String>,
        applied_this_run: Vec<String>,
    },

    #[error("migration {migration} failed for {tenant}: {message}")]
    MigrationFailed {
        tenant: String,
        migration: String,
        applied_this_run: Vec<String>,
        message: String,
    },

    #[error("a migration run is already in progress for {tenant}")]
    MigrationInProgress { tenant: String },

    #[error("invalid status transition for {tenant}: {from} -> {to}")]
    InvalidTransition {
        tenant: String,
        from: String,
        to: String,
    },

    #[error("migration ledger for {tenant} is inconsistent: {detail}")]
    LedgerInconsistent { tenant: String, detail: String },

    #[error("tenant code already registered: {code}")]
    DuplicateTenant { code: String },

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

impl DbInfraError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn unavailable(tenant: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TenantUnavailable {
            tenant: tenant.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(tenant: impl Into<String>, operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::BackingStoreTimeout {
            tenant: tenant.into(),
            operation: operation.into(),
            timeout_ms,
            migration: None,
            applied_this_run: Vec::new(),
        }
    }

    /// Attribute a failure to the migration step it interrupted, keeping what
    /// the run committed before it. Timeouts keep their kind; ledger
    /// inconsistencies are reported as such.
    pub fn at_migration(self, tenant: &str, migration: &str, applied: Vec<String>) -> Self {
        match self {
            DbInfraError::BackingStoreTimeout {
                operation,
                timeout_ms,
                ..
            } => DbInfraError::BackingStoreTimeout {
                tenant: tenant.to_string(),
                operation,
                timeout_ms,
                migration: Some(migration.to_string()),
                applied_this_run: applied,
            },
            e @ (DbInfraError::LedgerInconsistent { .. } | DbInfraError::MigrationFailed { .. }) => e,
            other => DbInfraError::MigrationFailed {
                tenant: tenant.to_string(),
                migration: migration.to_string(),
                applied_this_run: applied,
                message: other.to_string(),
            },
        }
    }

    /// Stable machine-readable kind, shared by the HTTP surface and the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            DbInfraError::Config { .. } => "CONFIG_ERROR",
            DbInfraError::TenantNotFound { .. } => "TENANT_NOT_FOUND",
            DbInfraError::TenantUnavailable { .. } => "TENANT_UNAVAILABLE",
            DbInfraError::BackingStoreUnreachable { .. } => "BACKING_STORE_UNREACHABLE",
            DbInfraError::BackingStoreTimeout { .. } => "BACKING_STORE_TIMEOUT",
            DbInfraError::MigrationFailed { .. } => "MIGRATION_FAILED",
            DbInfraError::MigrationInProgress { .. } => "MIGRATION_IN_PROGRESS",
            DbInfraError::InvalidTransition { .. } => "INVALID_TRANSITION",
            DbInfraError::LedgerInconsistent { .. } => "LEDGER_INCONSISTENT",
            DbInfraError::DuplicateTenant { .. } => "DUPLICATE_TENANT",
            DbInfraError::Db(_) => "DB_ERROR",
        }
    }

    /// The migration a failure is attributed to, if any.
    pub fn migration(&self) -> Option<&str> {
        match self {
            DbInfraError::MigrationFailed { migration, .. } => Some(migration),
            DbInfraError::BackingStoreTimeout { migration, .. } => migration.as_deref(),
            _ => None,
        }
    }

    /// Migrations committed earlier in the run that this failure interrupted.
    pub fn applied_this_run(&self) -> &[String] {
        match self {
            DbInfraError::MigrationFailed {
                applied_this_run, ..
            }
            | DbInfraError::BackingStoreTimeout {
                applied_this_run, ..
            } => applied_this_run,
            _ => &[],
        }
    }

    /// Connectivity failures worth retrying with backoff. Everything else,
    /// timeouts included, is surfaced to the caller unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            DbInfraError::BackingStoreUnreachable { .. } => true,
            DbInfraError::Db(sea_orm::DbErr::Conn(_))
            | DbInfraError::Db(sea_orm::DbErr::ConnectionAcquire(_)) => true,
            _ => false,
        }
    }
}
