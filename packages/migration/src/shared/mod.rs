pub mod m20250901_000001_create_tenants;
pub mod m20250901_000002_create_tenant_audit_log;
