//! # 配额结算实体定义
//!
//! 以 `request_id` 唯一约束承载结算/退款的至多一次语义；
//! 重复的 settle 或 refund 在插入冲突处短路为无操作。

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 结算类型
pub const SETTLEMENT_KIND_SETTLED: &str = "settled";
pub const SETTLEMENT_KIND_REFUNDED: &str = "refunded";

/// 配额结算实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "quota_settlements")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub request_id: String,
    pub token_id: i32,
    /// 预扣金额
    pub pre_charge: i64,
    /// 实际结算金额；退款时为空
    pub settled_cost: Option<i64>,
    /// settled / refunded
    pub kind: String,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tokens::Entity",
        from = "Column::TokenId",
        to = "super::tokens::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Token,
}

impl Related<super::tokens::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Token.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
