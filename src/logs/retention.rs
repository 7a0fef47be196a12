//! # 日志载荷保留期清理
//!
//! 每 6 小时按 `created_at` 范围分批删除过期 `log_details`：
//! 单批至多 5000 行、按 `created_at ASC` 排序、批间停 100ms，
//! 外层循环可被取消。`log_records` 永不删除。

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use entity::log_details::{self, Entity as LogDetails};

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const CLEANUP_BATCH_SIZE: u64 = 5000;
const BATCH_PAUSE: Duration = Duration::from_millis(100);

/// 删除超过保留期的载荷行，返回删除总数。
///
/// 选主键再按主键删，三种存储后端语义一致；范围查询靠
/// `created_at` 索引避免全表扫描。
pub async fn prune_expired_log_details(
    db: &DatabaseConnection,
    retention_days: i64,
    cancel: &CancellationToken,
) -> Result<u64> {
    if retention_days <= 0 {
        return Ok(0);
    }
    let cutoff = (Utc::now() - ChronoDuration::days(retention_days)).naive_utc();
    let mut total_deleted: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            lwarn!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Retention,
                "prune_cancelled",
                "保留期清理被取消"
            );
            break;
        }

        let expired: Vec<i64> = LogDetails::find()
            .select_only()
            .column(log_details::Column::Id)
            .filter(log_details::Column::CreatedAt.lt(cutoff))
            .order_by_asc(log_details::Column::CreatedAt)
            .limit(CLEANUP_BATCH_SIZE)
            .into_tuple()
            .all(db)
            .await?;
        if expired.is_empty() {
            break;
        }
        let batch_len = expired.len() as u64;

        LogDetails::delete_many()
            .filter(log_details::Column::Id.is_in(expired))
            .exec(db)
            .await?;
        total_deleted += batch_len;

        if batch_len < CLEANUP_BATCH_SIZE {
            break;
        }
        tokio::time::sleep(BATCH_PAUSE).await;
    }

    if total_deleted > 0 {
        linfo!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Retention,
            "pruned",
            "已删除过期日志载荷",
            deleted = total_deleted,
            retention_days = retention_days
        );
    }
    Ok(total_deleted)
}

/// 后台清理循环；启动即执行一轮
pub fn start_retention_loop(
    db: DatabaseConnection,
    retention_days: i64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if retention_days <= 0 {
            return;
        }
        loop {
            if let Err(err) = prune_expired_log_details(&db, retention_days, &cancel).await {
                lwarn!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::Retention,
                    "prune_failed",
                    "保留期清理失败",
                    error = %err
                );
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(CLEANUP_INTERVAL) => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use entity::log_records;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{Database, Set};

    async fn seed_owner(db: &DatabaseConnection) -> (i32, i32) {
        let user = entity::users::Entity::insert(entity::users::ActiveModel {
            username: Set("sweeper".to_string()),
            group: Set("default".to_string()),
            ..Default::default()
        })
        .exec_with_returning(db)
        .await
        .unwrap();
        let token = entity::tokens::Entity::insert(entity::tokens::ActiveModel {
            user_id: Set(user.id),
            key: Set("sweepkey".to_string()),
            name: Set("sweep".to_string()),
            ..Default::default()
        })
        .exec_with_returning(db)
        .await
        .unwrap();
        (user.id, token.id)
    }

    async fn insert_pair(
        db: &DatabaseConnection,
        owner: (i32, i32),
        request_id: &str,
        age_days: i64,
    ) {
        let created = (Utc::now() - ChronoDuration::days(age_days)).naive_utc();
        let record = log_records::ActiveModel {
            request_id: Set(request_id.to_string()),
            user_id: Set(owner.0),
            token_id: Set(owner.1),
            model: Set("gpt-4o-mini".to_string()),
            dialect: Set("chat_completions".to_string()),
            status: Set("ok".to_string()),
            created_at: Set(created),
            ..Default::default()
        };
        let record = log_records::Entity::insert(record)
            .exec_with_returning(db)
            .await
            .unwrap();
        log_details::Entity::insert(log_details::ActiveModel {
            record_id: Set(record.id),
            response_full: Set(Some("payload".to_string())),
            created_at: Set(created),
            ..Default::default()
        })
        .exec(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn prune_deletes_only_expired_details() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let cancel = CancellationToken::new();

        let owner = seed_owner(&db).await;
        insert_pair(&db, owner, "old-1", 10).await;
        insert_pair(&db, owner, "old-2", 8).await;
        insert_pair(&db, owner, "fresh", 1).await;

        let deleted = prune_expired_log_details(&db, 7, &cancel).await.unwrap();
        assert_eq!(deleted, 2);

        // 载荷只剩保留期内的；记录一条不少
        let details = log_details::Entity::find().all(&db).await.unwrap();
        assert_eq!(details.len(), 1);
        let records = log_records::Entity::find().all(&db).await.unwrap();
        assert_eq!(records.len(), 3);

        let cutoff = (Utc::now() - ChronoDuration::days(7)).naive_utc();
        assert!(details[0].created_at >= cutoff);
    }

    #[tokio::test]
    async fn non_positive_retention_disables_prune() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let owner = seed_owner(&db).await;
        insert_pair(&db, owner, "old", 100).await;

        let deleted = prune_expired_log_details(&db, 0, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(log_details::Entity::find().all(&db).await.unwrap().len(), 1);
    }
}
