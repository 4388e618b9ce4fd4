use migration::{MigrationName, MigrationTrait, MigratorTrait, SharedMigrator, TenantMigrator};
use serde::Serialize;

use crate::error::DbInfraError;

/// Static description of one schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationDescriptor {
    pub name: String,
    pub version: i64,
    /// Ledger primary key; a migration is applied at most once per store.
    pub idempotency_key: String,
}

pub struct CatalogEntry {
    pub descriptor: MigrationDescriptor,
    pub migration: Box<dyn MigrationTrait>,
}

/// Ordered, validated list of migrations for one kind of store.
pub struct MigrationCatalog {
    entries: Vec<CatalogEntry>,
}

impl MigrationCatalog {
    /// Versions come from the `mYYYYMMDD_NNNNNN_description` naming scheme and
    /// must be strictly increasing in list order.
    pub fn new(migrations: Vec<Box<dyn MigrationTrait>>) -> Result<Self, DbInfraError> {
        let mut entries: Vec<CatalogEntry> = Vec::with_capacity(migrations.len());
        for migration in migrations {
            let name = migration.name().to_string();
            let version = parse_version(&name)?;
            if let Some(prev) = entries.last() {
                if version <= prev.descriptor.version {
                    return Err(DbInfraError::config(format!(
                        "migration catalog out of order: {} (v{}) follows {} (v{})",
                        name, version, prev.descriptor.name, prev.descriptor.version
                    )));
                }
            }
            entries.push(CatalogEntry {
                descriptor: MigrationDescriptor {
                    idempotency_key: name.clone(),
                    name,
                    version,
                },
                migration,
            });
        }
        Ok(Self { entries })
    }

    pub fn tenant() -> Result<Self, DbInfraError> {
        Self::new(TenantMigrator::migrations())
    }

    pub fn shared() -> Result<Self, DbInfraError> {
        Self::new(SharedMigrator::migrations())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    pub fn descriptors(&self) -> Vec<MigrationDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }
}

/// `m20250901_000003_create_invoices` -> `20250901000003`.
pub fn parse_version(name: &str) -> Result<i64, DbInfraError> {
    let invalid = || {
        DbInfraError::config(format!(
            "migration name '{name}' does not follow mYYYYMMDD_NNNNNN_description"
        ))
    };
    let rest = name.strip_prefix('m').ok_or_else(invalid)?;
    let mut parts = rest.splitn(3, '_');
    let date = parts.next().ok_or_else(invalid)?;
    let seq = parts.next().ok_or_else(invalid)?;
    if date.len() != 8
        || seq.len() != 6
        || !date.bytes().all(|b| b.is_ascii_digit())
        || !seq.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }
    format!("{date}{seq}").parse().map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_parse_from_names() {
        assert_eq!(
            parse_version("m20250901_000003_create_invoices").unwrap(),
            20250901000003
        );
        assert_eq!(parse_version("m20250101_000001").unwrap(), 20250101000001);
        assert!(parse_version("20250901_000003_x").is_err());
        assert!(parse_version("m2025_000003_x").is_err());
        assert!(parse_version("m20250901_00000a_x").is_err());
    }

    #[test]
    fn bundled_catalogs_are_valid() {
        let tenant = MigrationCatalog::tenant().unwrap();
        assert_eq!(tenant.len(), 3);
        let versions: Vec<i64> = tenant.iter().map(|e| e.descriptor.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert!(!MigrationCatalog::shared().unwrap().is_empty());
    }
}
