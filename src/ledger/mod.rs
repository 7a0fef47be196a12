//! # 配额账本
//!
//! 预扣 / 结算 / 退款三段式协议。余额扣减走存储层条件更新
//! （`quota >= cost` 才减），不在进程内跨 I/O 持锁；结算与退款
//! 通过 `quota_settlements.request_id` 唯一约束保证至多一次生效。

use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use entity::quota_settlements::{
    self, Entity as QuotaSettlements, SETTLEMENT_KIND_REFUNDED, SETTLEMENT_KIND_SETTLED,
};
use entity::{tokens, users};

use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::types::{QuotaAmount, TokenId, UserId};
use crate::{ldebug, linfo};

/// 一笔已生效的预扣
#[derive(Debug, Clone, Copy)]
pub struct PreCharge {
    pub amount: QuotaAmount,
    pub token_id: TokenId,
    pub user_id: UserId,
    /// 令牌共享用户余额时扣用户行，否则扣令牌行
    pub shared_quota: bool,
}

/// 配额账本
pub struct QuotaLedger {
    db: DatabaseConnection,
}

impl QuotaLedger {
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// 预扣：条件减额，余额不足即拒绝。
    pub async fn pre_charge(
        &self,
        token: &tokens::Model,
        user: &users::Model,
        amount: QuotaAmount,
    ) -> Result<PreCharge> {
        let pre_charge = PreCharge {
            amount,
            token_id: token.id,
            user_id: user.id,
            shared_quota: token.unlimited_quota,
        };
        if amount <= 0 {
            return Ok(pre_charge);
        }

        let rows = if token.unlimited_quota {
            users::Entity::update_many()
                .col_expr(
                    users::Column::Quota,
                    Expr::col(users::Column::Quota).sub(amount),
                )
                .filter(users::Column::Id.eq(user.id))
                .filter(users::Column::Quota.gte(amount))
                .exec(&self.db)
                .await?
                .rows_affected
        } else {
            tokens::Entity::update_many()
                .col_expr(
                    tokens::Column::Quota,
                    Expr::col(tokens::Column::Quota).sub(amount),
                )
                .filter(tokens::Column::Id.eq(token.id))
                .filter(tokens::Column::Quota.gte(amount))
                .exec(&self.db)
                .await?
                .rows_affected
        };

        if rows == 0 {
            return Err(RelayError::InsufficientQuota);
        }
        Ok(pre_charge)
    }

    /// 结算：按实际用量多退少补。同一 `request_id` 重复调用为无操作。
    ///
    /// 返回生效的差额（正数为退还、负数为补扣）；幂等短路时返回 0。
    pub async fn settle(
        &self,
        request_id: &str,
        pre_charge: &PreCharge,
        actual_cost: QuotaAmount,
    ) -> Result<QuotaAmount> {
        if !self
            .claim_settlement(
                request_id,
                pre_charge,
                Some(actual_cost),
                SETTLEMENT_KIND_SETTLED,
            )
            .await?
        {
            ldebug!(
                request_id,
                LogStage::Internal,
                LogComponent::Ledger,
                "settle_noop",
                "结算已生效过，跳过"
            );
            return Ok(0);
        }

        let delta = pre_charge.amount - actual_cost;
        if delta != 0 {
            self.adjust_quota(pre_charge, delta).await?;
        }
        self.bump_used_quota(pre_charge, actual_cost).await?;

        linfo!(
            request_id,
            LogStage::Internal,
            LogComponent::Ledger,
            "settled",
            "配额结算完成",
            pre_charge = pre_charge.amount,
            actual_cost = actual_cost,
            delta = delta
        );
        Ok(delta)
    }

    /// 退款：请求整体失败（未见任何上游 2xx）时全额返还预扣。
    pub async fn refund(&self, request_id: &str, pre_charge: &PreCharge) -> Result<()> {
        if !self
            .claim_settlement(request_id, pre_charge, None, SETTLEMENT_KIND_REFUNDED)
            .await?
        {
            ldebug!(
                request_id,
                LogStage::Internal,
                LogComponent::Ledger,
                "refund_noop",
                "该请求已结算或已退款，跳过"
            );
            return Ok(());
        }
        if pre_charge.amount > 0 {
            self.adjust_quota(pre_charge, pre_charge.amount).await?;
        }
        linfo!(
            request_id,
            LogStage::Internal,
            LogComponent::Ledger,
            "refunded",
            "预扣配额已全额退还",
            pre_charge = pre_charge.amount
        );
        Ok(())
    }

    /// 抢占结算席位；冲突说明该请求已有生效记录
    async fn claim_settlement(
        &self,
        request_id: &str,
        pre_charge: &PreCharge,
        settled_cost: Option<QuotaAmount>,
        kind: &str,
    ) -> Result<bool> {
        let rows = QuotaSettlements::insert(quota_settlements::ActiveModel {
            request_id: Set(request_id.to_string()),
            token_id: Set(pre_charge.token_id),
            pre_charge: Set(pre_charge.amount),
            settled_cost: Set(settled_cost),
            kind: Set(kind.to_string()),
            created_at: Set(Utc::now().naive_utc()),
            ..Default::default()
        })
        .on_conflict(
            OnConflict::column(quota_settlements::Column::RequestId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(&self.db)
        .await?;
        Ok(rows > 0)
    }

    /// 余额调整；delta 为正时返还、为负时补扣（允许透支补扣）
    async fn adjust_quota(&self, pre_charge: &PreCharge, delta: QuotaAmount) -> Result<()> {
        if pre_charge.shared_quota {
            users::Entity::update_many()
                .col_expr(
                    users::Column::Quota,
                    Expr::col(users::Column::Quota).add(delta),
                )
                .filter(users::Column::Id.eq(pre_charge.user_id))
                .exec(&self.db)
                .await?;
        } else {
            tokens::Entity::update_many()
                .col_expr(
                    tokens::Column::Quota,
                    Expr::col(tokens::Column::Quota).add(delta),
                )
                .filter(tokens::Column::Id.eq(pre_charge.token_id))
                .exec(&self.db)
                .await?;
        }
        Ok(())
    }

    /// 累计消耗统计（令牌与用户都记）
    async fn bump_used_quota(
        &self,
        pre_charge: &PreCharge,
        actual_cost: QuotaAmount,
    ) -> Result<()> {
        if actual_cost <= 0 {
            return Ok(());
        }
        tokens::Entity::update_many()
            .col_expr(
                tokens::Column::UsedQuota,
                Expr::col(tokens::Column::UsedQuota).add(actual_cost),
            )
            .filter(tokens::Column::Id.eq(pre_charge.token_id))
            .exec(&self.db)
            .await?;
        users::Entity::update_many()
            .col_expr(
                users::Column::UsedQuota,
                Expr::col(users::Column::UsedQuota).add(actual_cost),
            )
            .filter(users::Column::Id.eq(pre_charge.user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn setup() -> (DatabaseConnection, users::Model, tokens::Model) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        let user = users::Entity::insert(users::ActiveModel {
            username: Set("alice".to_string()),
            group: Set("default".to_string()),
            quota: Set(100_000),
            ..Default::default()
        })
        .exec_with_returning(&db)
        .await
        .unwrap();

        let token = tokens::Entity::insert(tokens::ActiveModel {
            user_id: Set(user.id),
            key: Set("testkey".to_string()),
            name: Set("test".to_string()),
            quota: Set(10_000),
            unlimited_quota: Set(false),
            ..Default::default()
        })
        .exec_with_returning(&db)
        .await
        .unwrap();

        (db, user, token)
    }

    async fn token_quota(db: &DatabaseConnection, id: TokenId) -> QuotaAmount {
        tokens::Entity::find_by_id(id)
            .one(db)
            .await
            .unwrap()
            .unwrap()
            .quota
    }

    #[tokio::test]
    async fn pre_charge_deducts_and_rejects_overdraft() {
        let (db, user, token) = setup().await;
        let ledger = QuotaLedger::new(db.clone());

        let pre_charge = ledger.pre_charge(&token, &user, 4000).await.unwrap();
        assert_eq!(pre_charge.amount, 4000);
        assert_eq!(token_quota(&db, token.id).await, 6000);

        let denied = ledger.pre_charge(&token, &user, 7000).await;
        assert!(matches!(denied, Err(RelayError::InsufficientQuota)));
        // 拒绝时余额不变
        assert_eq!(token_quota(&db, token.id).await, 6000);
    }

    #[tokio::test]
    async fn settle_refunds_surplus_once() {
        let (db, user, token) = setup().await;
        let ledger = QuotaLedger::new(db.clone());

        let pre_charge = ledger.pre_charge(&token, &user, 4000).await.unwrap();
        let delta = ledger.settle("req-1", &pre_charge, 1500).await.unwrap();
        assert_eq!(delta, 2500);
        assert_eq!(token_quota(&db, token.id).await, 8500);

        // 重复结算无效果
        let delta = ledger.settle("req-1", &pre_charge, 1500).await.unwrap();
        assert_eq!(delta, 0);
        assert_eq!(token_quota(&db, token.id).await, 8500);

        // 结算后退款同样无效果
        ledger.refund("req-1", &pre_charge).await.unwrap();
        assert_eq!(token_quota(&db, token.id).await, 8500);
    }

    #[tokio::test]
    async fn settle_debits_shortfall() {
        let (db, user, token) = setup().await;
        let ledger = QuotaLedger::new(db.clone());

        let pre_charge = ledger.pre_charge(&token, &user, 1000).await.unwrap();
        let delta = ledger.settle("req-2", &pre_charge, 1800).await.unwrap();
        assert_eq!(delta, -800);
        assert_eq!(token_quota(&db, token.id).await, 8200);
    }

    #[tokio::test]
    async fn refund_restores_full_pre_charge_once() {
        let (db, user, token) = setup().await;
        let ledger = QuotaLedger::new(db.clone());

        let pre_charge = ledger.pre_charge(&token, &user, 3000).await.unwrap();
        ledger.refund("req-3", &pre_charge).await.unwrap();
        assert_eq!(token_quota(&db, token.id).await, 10_000);

        ledger.refund("req-3", &pre_charge).await.unwrap();
        assert_eq!(token_quota(&db, token.id).await, 10_000);

        // 退款后结算被幂等短路
        let delta = ledger.settle("req-3", &pre_charge, 500).await.unwrap();
        assert_eq!(delta, 0);
        assert_eq!(token_quota(&db, token.id).await, 10_000);
    }

    #[tokio::test]
    async fn shared_quota_debits_user_row() {
        let (db, user, mut token) = setup().await;
        token.unlimited_quota = true;
        let ledger = QuotaLedger::new(db.clone());

        let pre_charge = ledger.pre_charge(&token, &user, 2000).await.unwrap();
        assert!(pre_charge.shared_quota);
        let stored = users::Entity::find_by_id(user.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.quota, 98_000);
        // 令牌独立额度未动
        assert_eq!(token_quota(&db, token.id).await, 10_000);
    }

    #[tokio::test]
    async fn quota_conservation_over_request_sequence() {
        let (db, user, token) = setup().await;
        let ledger = QuotaLedger::new(db.clone());

        // 三笔请求：成功 1200、成功 800、失败退款
        let mut settled_total = 0;
        let p1 = ledger.pre_charge(&token, &user, 2000).await.unwrap();
        settled_total += ledger.settle("seq-1", &p1, 1200).await.map(|_| 1200).unwrap();
        let p2 = ledger.pre_charge(&token, &user, 1000).await.unwrap();
        settled_total += ledger.settle("seq-2", &p2, 800).await.map(|_| 800).unwrap();
        let p3 = ledger.pre_charge(&token, &user, 3000).await.unwrap();
        ledger.refund("seq-3", &p3).await.unwrap();

        let final_quota = token_quota(&db, token.id).await;
        assert_eq!(10_000 - final_quota, settled_total);

        let stored = tokens::Entity::find_by_id(token.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.used_quota, settled_total);
    }
}
