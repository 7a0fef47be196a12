use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Channels::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Channels::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Channels::Name).string_len(128).not_null())
                    .col(ColumnDef::new(Channels::Family).string_len(32).not_null())
                    .col(ColumnDef::new(Channels::BaseUrl).string_len(512).not_null())
                    .col(ColumnDef::new(Channels::Key).text().not_null())
                    .col(
                        ColumnDef::new(Channels::Status)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Channels::Priority)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Channels::Weight)
                            .big_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(Channels::Models).text().not_null())
                    .col(ColumnDef::new(Channels::ModelMapping).text())
                    .col(
                        ColumnDef::new(Channels::Groups)
                            .string_len(255)
                            .not_null()
                            .default("default"),
                    )
                    .col(ColumnDef::new(Channels::HeaderOverride).text())
                    .col(
                        ColumnDef::new(Channels::PassThrough)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Channels::RpmLimit).integer())
                    .col(ColumnDef::new(Channels::TpmLimit).integer())
                    .col(
                        ColumnDef::new(Channels::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Channels::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Channels::TestAt).timestamp())
                    .to_owned(),
            )
            .await?;

        // 注册表定时刷新按状态过滤
        manager
            .create_index(
                Index::create()
                    .name("idx_channels_status")
                    .table(Channels::Table)
                    .col(Channels::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Channels::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Channels {
    Table,
    Id,
    Name,
    Family,
    BaseUrl,
    Key,
    Status,
    Priority,
    Weight,
    Models,
    ModelMapping,
    Groups,
    HeaderOverride,
    PassThrough,
    RpmLimit,
    TpmLimit,
    CreatedAt,
    UpdatedAt,
    TestAt,
}
