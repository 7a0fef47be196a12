//! # API令牌实体定义
//!
//! 网关下发的鉴权凭证表，配额可与所属用户共享或独立

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 令牌状态：1=启用 2=禁用 3=已过期 4=配额耗尽
pub const TOKEN_STATUS_ENABLED: i32 = 1;
pub const TOKEN_STATUS_DISABLED: i32 = 2;
pub const TOKEN_STATUS_EXPIRED: i32 = 3;
pub const TOKEN_STATUS_EXHAUSTED: i32 = 4;

/// API令牌实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub user_id: i32,
    /// 不含 `sk-` 前缀的密钥体
    #[sea_orm(unique)]
    pub key: String,
    pub name: String,
    pub status: i32,
    /// 独立配额余额；`unlimited_quota` 为真时共享用户余额
    pub quota: i64,
    pub used_quota: i64,
    pub unlimited_quota: bool,
    /// 允许的模型白名单（逗号分隔，空表示不限制）
    pub models: Option<String>,
    /// 允许访问的渠道分组（逗号分隔，空表示仅 default）
    pub groups: Option<String>,
    /// 过期时间戳（秒），空或 <=0 表示永不过期
    pub expired_at: Option<i64>,
    pub created_at: DateTime,
    pub accessed_at: DateTime,
}

impl Model {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status == TOKEN_STATUS_ENABLED
    }

    /// 按逗号拆出模型白名单；空列表表示不限制
    #[must_use]
    pub fn allowed_models(&self) -> Vec<String> {
        split_list(self.models.as_deref())
    }

    /// 按逗号拆出可见分组；空时退回 `default`
    #[must_use]
    pub fn allowed_groups(&self) -> Vec<String> {
        let groups = split_list(self.groups.as_deref());
        if groups.is_empty() {
            vec!["default".to_string()]
        } else {
            groups
        }
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
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
    #[sea_orm(has_many = "super::log_records::Entity")]
    LogRecords,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::log_records::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LogRecords.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::split_list;

    #[test]
    fn split_list_trims_and_drops_empty() {
        assert_eq!(
            split_list(Some(" gpt-4o , ,claude-3-5-sonnet ")),
            vec!["gpt-4o".to_string(), "claude-3-5-sonnet".to_string()]
        );
        assert!(split_list(None).is_empty());
        assert!(split_list(Some("")).is_empty());
    }
}
