use std::time::Duration;

use async_trait::async_trait;
use db_infra::tenancy::catalog::parse_version;
use db_infra::MigrationCatalog;
use migration::{MigrationName, MigrationTrait, SchemaManager};
use sea_orm::{ConnectionTrait, DbErr};

#[derive(Debug, Clone)]
enum Step {
    Create(String),
    Fail(String),
    Sleep(String, Duration),
    CreateAndRecord(String, String),
}

/// A migration whose body is chosen by the test.
#[derive(Debug, Clone)]
pub struct ScriptedMigration {
    name: String,
    step: Step,
}

impl ScriptedMigration {
    /// Creates `table` with a single integer column.
    pub fn creates(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            step: Step::Create(table.to_string()),
        }
    }

    /// Creates `table`, then fails; the table must not survive the rollback.
    pub fn fails_after_creating(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            step: Step::Fail(table.to_string()),
        }
    }

    /// Creates `table`, then writes a ledger record for the later migration
    /// `recorded`, as a concurrent administrative run would.
    pub fn creates_and_records(name: &str, table: &str, recorded: &str) -> Self {
        Self {
            name: name.to_string(),
            step: Step::CreateAndRecord(table.to_string(), recorded.to_string()),
        }
    }

    /// Creates `table` after sleeping for `delay`.
    pub fn slow(name: &str, table: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            step: Step::Sleep(table.to_string(), delay),
        }
    }
}

async fn create_table(manager: &SchemaManager<'_>, table: &str) -> Result<(), DbErr> {
    manager
        .get_connection()
        .execute_unprepared(&format!(
            "CREATE TABLE {table} (id INTEGER PRIMARY KEY, note TEXT)"
        ))
        .await?;
    Ok(())
}

impl MigrationName for ScriptedMigration {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl MigrationTrait for ScriptedMigration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        match &self.step {
            Step::Create(table) => create_table(manager, table).await,
            Step::Fail(table) => {
                create_table(manager, table).await?;
                Err(DbErr::Migration(format!("{} refused to apply", self.name)))
            }
            Step::Sleep(table, delay) => {
                tokio::time::sleep(*delay).await;
                create_table(manager, table).await
            }
            Step::CreateAndRecord(table, recorded) => {
                create_table(manager, table).await?;
                let version =
                    parse_version(recorded).map_err(|e| DbErr::Migration(e.to_string()))?;
                // tenant and timestamp are copied from the first record of the run
                manager
                    .get_connection()
                    .execute_unprepared(&format!(
                        "INSERT INTO schema_migrations (migration_name, version, tenant_id, applied_at) \
                         SELECT '{recorded}', {version}, tenant_id, applied_at \
                         FROM schema_migrations LIMIT 1"
                    ))
                    .await?;
                Ok(())
            }
        }
    }
}

pub fn scripted_catalog(migrations: Vec<ScriptedMigration>) -> MigrationCatalog {
    let boxed: Vec<Box<dyn MigrationTrait>> = migrations
        .into_iter()
        .map(|m| Box::new(m) as Box<dyn MigrationTrait>)
        .collect();
    MigrationCatalog::new(boxed).expect("scripted catalog should be ordered")
}
