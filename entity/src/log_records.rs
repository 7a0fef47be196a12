//! # 请求日志实体定义
//!
//! 小而长存的请求记录；大体积载荷拆分到 `log_details` 并按保留期清理

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 请求日志实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "log_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub request_id: String,
    pub user_id: i32,
    pub token_id: i32,
    /// 最终成功（或最后一次尝试）的渠道
    pub channel_id: Option<i32>,
    /// 首次尝试的渠道，重试后仍保留
    pub first_channel_id: Option<i32>,
    pub model: String,
    /// 入站方言（chat_completions / claude_messages / ...）
    pub dialect: String,
    pub is_stream: bool,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub cached_tokens: i32,
    pub reasoning_tokens: i32,
    pub image_tokens: i32,
    pub total_tokens: i32,
    /// 实际结算的配额
    pub quota_cost: i64,
    /// 用量来源：reported / computed / reconciled
    pub usage_source: String,
    /// ok / partially_delivered / 错误类别
    pub status: String,
    pub latency_ms: i64,
    /// 首字节延迟
    pub first_byte_ms: Option<i64>,
    pub retry_count: i32,
    pub client_ip: Option<String>,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,
    #[sea_orm(
        belongs_to = "super::tokens::Entity",
        from = "Column::TokenId",
        to = "super::tokens::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Token,
    #[sea_orm(
        belongs_to = "super::channels::Entity",
        from = "Column::ChannelId",
        to = "super::channels::Column::Id",
        on_update = "Cascade",
        on_delete = "SetNull"
    )]
    Channel,
    #[sea_orm(has_one = "super::log_details::Entity")]
    LogDetail,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::tokens::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Token.def()
    }
}

impl Related<super::channels::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Channel.def()
    }
}

impl Related<super::log_details::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LogDetail.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
