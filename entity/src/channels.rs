//! # 渠道实体定义
//!
//! 上游服务商端点表：凭证、模型覆盖、路由权重与冷却状态的持久侧

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 渠道状态：1=启用 2=手动禁用 3=自动禁用
pub const CHANNEL_STATUS_ENABLED: i32 = 1;
pub const CHANNEL_STATUS_MANUALLY_DISABLED: i32 = 2;
pub const CHANNEL_STATUS_AUTO_DISABLED: i32 = 3;

/// 渠道实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub name: String,
    /// 服务商家族标识（openai/azure/claude/gemini）
    pub family: String,
    pub base_url: String,
    /// 凭证材料；允许逗号分隔的密钥池
    pub key: String,
    pub status: i32,
    /// 调度优先级，大者先选
    pub priority: i64,
    /// 同优先级内的加权随机权重
    pub weight: i64,
    /// 渠道覆盖的模型（逗号分隔）
    pub models: String,
    /// 模型重写表 JSON：客户端名 -> 上游名
    pub model_mapping: Option<String>,
    /// 渠道分组标签（逗号分隔）
    pub groups: String,
    /// 头部覆盖模板 JSON：头名 -> 模板串
    pub header_override: Option<String>,
    /// 透传模式：转发客户端头（经脱敏过滤），上游错误体原样返回
    pub pass_through: bool,
    pub rpm_limit: Option<i32>,
    pub tpm_limit: Option<i32>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub test_at: Option<DateTime>,
}

impl Model {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status == CHANNEL_STATUS_ENABLED
    }

    /// 渠道覆盖的模型名集合
    #[must_use]
    pub fn model_list(&self) -> Vec<String> {
        self.models
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// 渠道分组集合；空退回 default
    #[must_use]
    pub fn group_list(&self) -> Vec<String> {
        let groups: Vec<String> = self
            .groups
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();
        if groups.is_empty() {
            vec!["default".to_string()]
        } else {
            groups
        }
    }

    /// 解析模型重写表；非法 JSON 视为无重写
    #[must_use]
    pub fn model_mapping_table(&self) -> HashMap<String, String> {
        self.model_mapping
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    /// 解析头部覆盖模板；非法 JSON 视为无覆盖
    #[must_use]
    pub fn header_override_table(&self) -> HashMap<String, String> {
        self.header_override
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::log_records::Entity")]
    LogRecords,
}

impl Related<super::log_records::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LogRecords.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_with(models: &str, mapping: Option<&str>) -> Model {
        Model {
            id: 1,
            name: "test".to_string(),
            family: "openai".to_string(),
            base_url: "https://api.openai.com".to_string(),
            key: "sk-upstream".to_string(),
            status: CHANNEL_STATUS_ENABLED,
            priority: 0,
            weight: 1,
            models: models.to_string(),
            model_mapping: mapping.map(str::to_string),
            groups: String::new(),
            header_override: None,
            pass_through: false,
            rpm_limit: None,
            tpm_limit: None,
            created_at: DateTime::default(),
            updated_at: DateTime::default(),
            test_at: None,
        }
    }

    #[test]
    fn model_list_splits_on_comma() {
        let channel = channel_with("gpt-4o-mini, gpt-4o", None);
        assert_eq!(channel.model_list(), vec!["gpt-4o-mini", "gpt-4o"]);
    }

    #[test]
    fn empty_groups_fall_back_to_default() {
        let channel = channel_with("gpt-4o", None);
        assert_eq!(channel.group_list(), vec!["default"]);
    }

    #[test]
    fn invalid_mapping_json_is_ignored() {
        let channel = channel_with("gpt-4o", Some("not json"));
        assert!(channel.model_mapping_table().is_empty());

        let channel = channel_with("gpt-4o", Some(r#"{"gpt-4o":"gpt-4o-2024-08-06"}"#));
        assert_eq!(
            channel.model_mapping_table().get("gpt-4o"),
            Some(&"gpt-4o-2024-08-06".to_string())
        );
    }
}
