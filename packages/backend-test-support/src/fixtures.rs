use std::sync::Arc;
use std::time::Duration;

use db_infra::{
    build_tenancy, DatabaseSettings, MigrationCatalog, PoolConnector, Tenant, TenantStatus,
    TenancyCore,
};
use tempfile::TempDir;

/// SQLite-file deployment in a throwaway directory.
///
/// Retry backoff is shortened so unreachable-store tests finish quickly.
pub struct TenancyFixture {
    pub dir: TempDir,
    pub settings: DatabaseSettings,
}

impl TenancyFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut settings = DatabaseSettings::sqlite_in(dir.path());
        settings.connect_attempts = 3;
        settings.connect_backoff_ms = 1;
        settings.connect_backoff_max_ms = 5;
        settings.close_timeout = Duration::from_secs(2);
        settings.migration_timeout = Duration::from_secs(10);
        Self { dir, settings }
    }

    pub fn configure(mut self, f: impl FnOnce(&mut DatabaseSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub async fn core(&self) -> TenancyCore {
        build_tenancy(self.settings.clone())
            .build()
            .await
            .expect("tenancy core should bootstrap")
    }

    pub async fn core_with(
        &self,
        connector: Arc<dyn PoolConnector>,
        catalog: Option<MigrationCatalog>,
    ) -> TenancyCore {
        let mut builder = build_tenancy(self.settings.clone()).with_connector(connector);
        if let Some(catalog) = catalog {
            builder = builder.with_tenant_catalog(catalog);
        }
        builder.build().await.expect("tenancy core should bootstrap")
    }
}

impl Default for TenancyFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Register `code` and walk it to `status` through allowed transitions.
pub async fn seed_tenant(core: &TenancyCore, code: &str, status: TenantStatus) -> Tenant {
    let registry = core.registry();
    let tenant = registry
        .register(code, &format!("{code} Ltd"))
        .await
        .expect("register tenant");
    if status == TenantStatus::Provisioning {
        return tenant;
    }
    let tenant = registry
        .transition_status(tenant.id, TenantStatus::Active)
        .await
        .expect("activate tenant");
    if status == TenantStatus::Active {
        return tenant;
    }
    registry
        .transition_status(tenant.id, status)
        .await
        .expect("move tenant to requested status")
}
