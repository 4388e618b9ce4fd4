pub mod schema_migrations;
pub mod tenant_audit_log;
pub mod tenants;

pub use schema_migrations::Entity as SchemaMigrations;
pub use schema_migrations::Model as AppliedMigration;
pub use tenant_audit_log::Entity as TenantAuditLog;
pub use tenants::Entity as Tenants;
pub use tenants::Model as Tenant;
pub use tenants::TenantStatus;
