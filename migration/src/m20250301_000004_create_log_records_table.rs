use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LogRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LogRecords::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LogRecords::RequestId)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(LogRecords::UserId).integer().not_null())
                    .col(ColumnDef::new(LogRecords::TokenId).integer().not_null())
                    .col(ColumnDef::new(LogRecords::ChannelId).integer())
                    .col(ColumnDef::new(LogRecords::FirstChannelId).integer())
                    .col(ColumnDef::new(LogRecords::Model).string_len(128).not_null())
                    .col(
                        ColumnDef::new(LogRecords::Dialect)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LogRecords::IsStream)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(LogRecords::PromptTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LogRecords::CompletionTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LogRecords::CachedTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LogRecords::ReasoningTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LogRecords::ImageTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LogRecords::TotalTokens)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LogRecords::QuotaCost)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(LogRecords::UsageSource)
                            .string_len(16)
                            .not_null()
                            .default("reported"),
                    )
                    .col(ColumnDef::new(LogRecords::Status).string_len(32).not_null())
                    .col(
                        ColumnDef::new(LogRecords::LatencyMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(LogRecords::FirstByteMs).big_integer())
                    .col(
                        ColumnDef::new(LogRecords::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(LogRecords::ClientIp).string_len(45))
                    .col(
                        ColumnDef::new(LogRecords::CreatedAt)
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
                    .name("idx_log_records_user_time")
                    .table(LogRecords::Table)
                    .col(LogRecords::UserId)
                    .col(LogRecords::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_log_records_token_time")
                    .table(LogRecords::Table)
                    .col(LogRecords::TokenId)
                    .col(LogRecords::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_log_records_channel_time")
                    .table(LogRecords::Table)
                    .col(LogRecords::ChannelId)
                    .col(LogRecords::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_log_records_created_at")
                    .table(LogRecords::Table)
                    .col(LogRecords::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LogRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum LogRecords {
    Table,
    Id,
    RequestId,
    UserId,
    TokenId,
    ChannelId,
    FirstChannelId,
    Model,
    Dialect,
    IsStream,
    PromptTokens,
    CompletionTokens,
    CachedTokens,
    ReasoningTokens,
    ImageTokens,
    TotalTokens,
    QuotaCost,
    UsageSource,
    Status,
    LatencyMs,
    FirstByteMs,
    RetryCount,
    ClientIp,
    CreatedAt,
}
