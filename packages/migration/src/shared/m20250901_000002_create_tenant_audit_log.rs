use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[derive(Iden)]
enum TenantAuditLog {
    Table,
    Id,
    TenantId,
    Actor,
    Action,
    RecordedAt,
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TenantAuditLog::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TenantAuditLog::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TenantAuditLog::TenantId).uuid().not_null())
                    .col(ColumnDef::new(TenantAuditLog::Actor).string_len(200).not_null())
                    .col(ColumnDef::new(TenantAuditLog::Action).string_len(64).not_null())
                    .col(
                        ColumnDef::new(TenantAuditLog::RecordedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tenant_audit_log_tenant")
                    .table(TenantAuditLog::Table)
                    .col(TenantAuditLog::TenantId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TenantAuditLog::Table).to_owned())
            .await
    }
}
