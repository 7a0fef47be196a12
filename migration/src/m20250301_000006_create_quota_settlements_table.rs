use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QuotaSettlements::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QuotaSettlements::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(QuotaSettlements::RequestId)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(QuotaSettlements::TokenId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QuotaSettlements::PreCharge)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(QuotaSettlements::SettledCost).big_integer())
                    .col(
                        ColumnDef::new(QuotaSettlements::Kind)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(QuotaSettlements::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_quota_settlements_token")
                    .table(QuotaSettlements::Table)
                    .col(QuotaSettlements::TokenId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(QuotaSettlements::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QuotaSettlements {
    Table,
    Id,
    RequestId,
    TokenId,
    PreCharge,
    SettledCost,
    Kind,
    CreatedAt,
}
