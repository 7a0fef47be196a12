use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LogDetails::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LogDetails::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LogDetails::RecordId)
                            .big_integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(LogDetails::RequestPreview).text())
                    .col(ColumnDef::new(LogDetails::RequestFull).text())
                    .col(ColumnDef::new(LogDetails::ResponsePreview).text())
                    .col(ColumnDef::new(LogDetails::ResponseFull).text())
                    .col(ColumnDef::new(LogDetails::UpstreamError).text())
                    .col(
                        ColumnDef::new(LogDetails::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_log_details_record_id")
                            .from(LogDetails::Table, LogDetails::RecordId)
                            .to(LogRecords::Table, LogRecords::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // 保留期清理按 created_at 做范围删除，缺索引会全表扫描
        manager
            .create_index(
                Index::create()
                    .name("idx_log_details_created_at")
                    .table(LogDetails::Table)
                    .col(LogDetails::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LogDetails::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LogDetails {
    Table,
    Id,
    RecordId,
    RequestPreview,
    RequestFull,
    ResponsePreview,
    ResponseFull,
    UpstreamError,
    CreatedAt,
}

#[derive(DeriveIden)]
enum LogRecords {
    Table,
    Id,
}
