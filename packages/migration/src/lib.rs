//! Static migration catalogs.
//!
//! `TenantMigrator` lists the schema changes applied to every per-tenant store;
//! `SharedMigrator` lists the changes for the shared/auth store. Neither is run
//! through sea-orm's own `up()`: the tenancy core applies them one at a time
//! against its own ledger, so only `migrations()` is ever called.

pub use sea_orm_migration::prelude::*;

mod shared;
mod tenant;

pub struct TenantMigrator;

#[async_trait::async_trait]
impl MigratorTrait for TenantMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(tenant::m20250901_000001_create_clients::Migration),
            Box::new(tenant::m20250901_000002_create_stock_items::Migration),
            Box::new(tenant::m20250901_000003_create_invoices::Migration),
        ]
    }
}

pub struct SharedMigrator;

#[async_trait::async_trait]
impl MigratorTrait for SharedMigrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(shared::m20250901_000001_create_tenants::Migration),
            Box::new(shared::m20250901_000002_create_tenant_audit_log::Migration),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(migrations: Vec<Box<dyn MigrationTrait>>) -> Vec<String> {
        migrations.iter().map(|m| m.name().to_string()).collect()
    }

    #[test]
    fn catalogs_are_listed_in_name_order() {
        for list in [
            names(TenantMigrator::migrations()),
            names(SharedMigrator::migrations()),
        ] {
            let mut sorted = list.clone();
            sorted.sort();
            assert_eq!(list, sorted);
            assert!(list.iter().all(|n| n.starts_with('m')));
        }
    }
}
