//! # 用户实体定义
//!
//! 用户基础信息表的 Sea-ORM 实体模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 用户状态：1=启用 2=禁用
pub const USER_STATUS_ENABLED: i32 = 1;
pub const USER_STATUS_DISABLED: i32 = 2;

/// 用户实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub username: String,
    /// 用户所属分组，决定可见渠道分组与价格档位
    pub group: String,
    /// 剩余配额（令牌与用户共享额度时从此扣减）
    pub quota: i64,
    /// 历史累计消耗
    pub used_quota: i64,
    pub status: i32,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Model {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status == USER_STATUS_ENABLED
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tokens::Entity")]
    Tokens,
    #[sea_orm(has_many = "super::log_records::Entity")]
    LogRecords,
}

impl Related<super::tokens::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tokens.def()
    }
}

impl Related<super::log_records::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LogRecords.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
