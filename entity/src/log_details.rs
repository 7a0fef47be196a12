//! # 日志载荷实体定义
//!
//! 与 `log_records` 一对一的大体积载荷表，按 `created_at` 保留期清理。
//! `created_at` 必须有索引，清理任务依赖它做范围删除。

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 日志载荷实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "log_details")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub record_id: i64,
    /// 截断后的请求预览（<=2048 码点）
    pub request_preview: Option<String>,
    /// 完整请求体
    #[sea_orm(column_type = "Text")]
    pub request_full: Option<String>,
    /// 截断后的响应预览
    pub response_preview: Option<String>,
    /// 完整响应体（流式时为事件串联）
    #[sea_orm(column_type = "Text")]
    pub response_full: Option<String>,
    /// 上游错误体原文（仅日志，不回传客户端）
    #[sea_orm(column_type = "Text")]
    pub upstream_error: Option<String>,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::log_records::Entity",
        from = "Column::RecordId",
        to = "super::log_records::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    LogRecord,
}

impl Related<super::log_records::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LogRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
