use std::collections::BTreeMap;
use std::sync::Arc;

use moka::future::Cache;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::db::{tenant_database_name, DatabaseSettings};
use crate::entities::{tenants, Tenant, TenantStatus, Tenants};
use crate::error::DbInfraError;
use crate::infra::db::core::with_deadline;

/// Asks the pool manager to drain a tenant whose status no longer permits connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainRequest {
    pub tenant_id: Uuid,
    pub code: String,
    pub status: TenantStatus,
}

/// Tenant records on the shared store. The only source of truth for which
/// tenants exist and whether they may be connected to.
pub struct TenantRegistry {
    shared: DatabaseConnection,
    settings: Arc<DatabaseSettings>,
    by_id: Cache<Uuid, Tenant>,
    drain_tx: Option<UnboundedSender<DrainRequest>>,
}

impl TenantRegistry {
    pub fn new(
        shared: DatabaseConnection,
        settings: Arc<DatabaseSettings>,
        drain_tx: Option<UnboundedSender<DrainRequest>>,
    ) -> Self {
        let by_id = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(settings.registry_cache_ttl)
            .build();
        Self {
            shared,
            settings,
            by_id,
            drain_tx,
        }
    }

    pub fn shared(&self) -> &DatabaseConnection {
        &self.shared
    }

    pub async fn list(&self, filter: Option<TenantStatus>) -> Result<Vec<Tenant>, DbInfraError> {
        let mut query = Tenants::find().order_by_asc(tenants::Column::Code);
        if let Some(status) = filter {
            query = query.filter(tenants::Column::Status.eq(status.as_str()));
        }
        with_deadline("shared", "registry_list", self.settings.statement_timeout, async {
            Ok(query.all(&self.shared).await?)
        })
        .await
    }

    /// Look a tenant up by UUID or by code (case-insensitive).
    pub async fn resolve(&self, code_or_id: &str) -> Result<Tenant, DbInfraError> {
        let key = code_or_id.trim();
        if let Ok(id) = Uuid::parse_str(key) {
            return self.get(id).await;
        }

        let code = key.to_ascii_uppercase();
        let found = with_deadline("shared", "registry_resolve", self.settings.statement_timeout, async {
            Ok(Tenants::find()
                .filter(tenants::Column::Code.eq(code.as_str()))
                .one(&self.shared)
                .await?)
        })
        .await?;

        match found {
            Some(tenant) => {
                self.by_id.insert(tenant.id, tenant.clone()).await;
                Ok(tenant)
            }
            None => Err(DbInfraError::TenantNotFound {
                tenant: key.to_string(),
            }),
        }
    }

    /// Look a tenant up by identifier, served from the short-lived cache when possible.
    pub async fn get(&self, id: Uuid) -> Result<Tenant, DbInfraError> {
        if let Some(tenant) = self.by_id.get(&id).await {
            return Ok(tenant);
        }
        let tenant = self.load(id).await?;
        self.by_id.insert(id, tenant.clone()).await;
        Ok(tenant)
    }

    /// Resolve and require a status that permits new connections.
    pub async fn resolve_operable(&self, code_or_id: &str) -> Result<Tenant, DbInfraError> {
        let tenant = self.resolve(code_or_id).await?;
        ensure_operable(&tenant)?;
        Ok(tenant)
    }

    pub async fn get_operable(&self, id: Uuid) -> Result<Tenant, DbInfraError> {
        let tenant = self.get(id).await?;
        ensure_operable(&tenant)?;
        Ok(tenant)
    }

    async fn load(&self, id: Uuid) -> Result<Tenant, DbInfraError> {
        with_deadline("shared", "registry_get", self.settings.statement_timeout, async {
            Ok(Tenants::find_by_id(id).one(&self.shared).await?)
        })
        .await?
        .ok_or_else(|| DbInfraError::TenantNotFound {
            tenant: id.to_string(),
        })
    }

    /// Record a new tenant in PROVISIONING. Codes are stored upper-cased and
    /// the backing-store name is derived from the configured convention.
    pub async fn register(&self, code: &str, display_name: &str) -> Result<Tenant, DbInfraError> {
        let code = normalize_code(code)?;
        let database_name = tenant_database_name(&self.settings.tenant_db_prefix, &code)?;

        let taken = with_deadline("shared", "registry_register", self.settings.statement_timeout, async {
            Ok(Tenants::find()
                .filter(
                    tenants::Column::Code
                        .eq(code.as_str())
                        .or(tenants::Column::DatabaseName.eq(database_name.as_str())),
                )
                .one(&self.shared)
                .await?)
        })
        .await?;
        if taken.is_some() {
            return Err(DbInfraError::DuplicateTenant { code });
        }

        let now = OffsetDateTime::now_utc();
        let model = tenants::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            display_name: Set(display_name.trim().to_string()),
            status: Set(TenantStatus::Provisioning),
            database_name: Set(database_name),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let tenant = with_deadline("shared", "registry_register", self.settings.statement_timeout, async {
            Ok(model.insert(&self.shared).await?)
        })
        .await?;

        info!(tenant = %tenant.code, id = %tenant.id, store = %tenant.database_name, "tenant=registered");
        Ok(tenant)
    }

    /// Validate and persist a status change. Moving to SUSPENDED or ARCHIVED
    /// queues a drain of the tenant's pool; the caller does not wait for it.
    pub async fn transition_status(
        &self,
        id: Uuid,
        next: TenantStatus,
    ) -> Result<Tenant, DbInfraError> {
        let current = self.load(id).await?;
        if current.status == next {
            debug!(tenant = %current.code, status = %next, "transition=noop");
            return Ok(current);
        }
        if !current.status.can_transition_to(next) {
            return Err(DbInfraError::InvalidTransition {
                tenant: current.code,
                from: current.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = OffsetDateTime::now_utc();
        // compare-and-set on the status we validated against
        let result = with_deadline("shared", "registry_transition", self.settings.statement_timeout, async {
            Ok(Tenants::update_many()
                .col_expr(tenants::Column::Status, Expr::value(next.as_str()))
                .col_expr(tenants::Column::UpdatedAt, Expr::value(now))
                .filter(tenants::Column::Id.eq(id))
                .filter(tenants::Column::Status.eq(current.status.as_str()))
                .exec(&self.shared)
                .await?)
        })
        .await?;
        self.by_id.invalidate(&id).await;

        if result.rows_affected == 0 {
            let raced = self.load(id).await?;
            return Err(DbInfraError::InvalidTransition {
                tenant: raced.code,
                from: raced.status.to_string(),
                to: next.to_string(),
            });
        }

        let from = current.status;
        let updated = Tenant {
            status: next,
            updated_at: now,
            ..current
        };
        info!(tenant = %updated.code, %from, to = %next, "tenant=transitioned");

        if next.requires_drain() {
            self.request_drain(&updated);
        }
        Ok(updated)
    }

    fn request_drain(&self, tenant: &Tenant) {
        let Some(tx) = &self.drain_tx else {
            return;
        };
        let request = DrainRequest {
            tenant_id: tenant.id,
            code: tenant.code.clone(),
            status: tenant.status,
        };
        if tx.send(request).is_err() {
            warn!(tenant = %tenant.code, "drain listener is gone; pool left to idle eviction");
        }
    }

    pub async fn count_by_status(&self) -> Result<BTreeMap<String, u64>, DbInfraError> {
        let rows: Vec<(TenantStatus, i64)> =
            with_deadline("shared", "registry_count", self.settings.statement_timeout, async {
                Ok(Tenants::find()
                    .select_only()
                    .column(tenants::Column::Status)
                    .column_as(Expr::col(tenants::Column::Id).count(), "n")
                    .group_by(tenants::Column::Status)
                    .into_tuple()
                    .all(&self.shared)
                    .await?)
            })
            .await?;

        let mut counts: BTreeMap<String, u64> = TenantStatus::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        for (status, n) in rows {
            counts.insert(status.to_string(), n.max(0) as u64);
        }
        Ok(counts)
    }
}

fn ensure_operable(tenant: &Tenant) -> Result<(), DbInfraError> {
    if tenant.status.accepts_connections() {
        Ok(())
    } else {
        Err(DbInfraError::unavailable(
            tenant.code.clone(),
            format!("status is {}", tenant.status),
        ))
    }
}

/// Codes are 1..=32 chars of `[A-Z0-9_-]` after upper-casing.
pub fn normalize_code(code: &str) -> Result<String, DbInfraError> {
    let code = code.trim().to_ascii_uppercase();
    let valid = !code.is_empty()
        && code.len() <= 32
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(code)
    } else {
        Err(DbInfraError::config(format!(
            "tenant code '{code}' must be 1-32 characters of A-Z, 0-9, '_' or '-'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_upper_cased_and_validated() {
        assert_eq!(normalize_code(" acme ").unwrap(), "ACME");
        assert_eq!(normalize_code("beta-2").unwrap(), "BETA-2");
        assert!(normalize_code("").is_err());
        assert!(normalize_code("no spaces").is_err());
        assert!(normalize_code(&"X".repeat(33)).is_err());
    }
}
