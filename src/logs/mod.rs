//! # 请求日志落库
//!
//! 小记录 + 大载荷成对写入：日志经有界通道汇入单写入任务，
//! 攒批或到期后在一个事务里落库，避免每请求一次往返。

pub mod retention;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set, TransactionTrait};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use entity::{log_details, log_records};

use crate::logging::{LogComponent, LogStage};
use crate::relay::usage::{Usage, UsageSource};
use crate::types::{ChannelId, QuotaAmount, TokenId, UserId};
use crate::{ldebug, lwarn};

/// 一条待写入的日志（记录 + 载荷）
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub request_id: String,
    pub user_id: UserId,
    pub token_id: TokenId,
    pub channel_id: Option<ChannelId>,
    pub first_channel_id: Option<ChannelId>,
    pub model: String,
    pub dialect: String,
    pub is_stream: bool,
    pub usage: Usage,
    pub usage_source: UsageSource,
    pub quota_cost: QuotaAmount,
    pub status: String,
    pub latency_ms: i64,
    pub first_byte_ms: Option<i64>,
    pub retry_count: i32,
    pub client_ip: Option<String>,
    pub request_preview: Option<String>,
    pub request_full: Option<String>,
    pub response_preview: Option<String>,
    pub response_full: Option<String>,
    pub upstream_error: Option<String>,
}

/// 日志服务句柄；克隆开销只有一个 Sender
#[derive(Clone)]
pub struct LogService {
    tx: mpsc::Sender<LogEntry>,
}

impl LogService {
    /// 启动写入任务并返回句柄
    pub fn start(
        db: DatabaseConnection,
        buffer_size: usize,
        flush_interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1) * 4);
        let handle = tokio::spawn(writer_loop(db, rx, buffer_size.max(1), flush_interval, cancel));
        (Self { tx }, handle)
    }

    /// 提交日志；队列满时丢弃并告警，不阻塞请求路径
    pub fn submit(&self, entry: LogEntry) {
        if let Err(err) = self.tx.try_send(entry) {
            lwarn!(
                "system",
                LogStage::Internal,
                LogComponent::LogWriter,
                "log_dropped",
                "日志队列已满，丢弃一条记录",
                error = %err
            );
        }
    }
}

async fn writer_loop(
    db: DatabaseConnection,
    mut rx: mpsc::Receiver<LogEntry>,
    buffer_size: usize,
    flush_interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut pending: Vec<LogEntry> = Vec::with_capacity(buffer_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                // 退出前冲出残余
                while let Ok(entry) = rx.try_recv() {
                    pending.push(entry);
                }
                flush(&db, &mut pending).await;
                break;
            }
            received = rx.recv() => {
                match received {
                    Some(entry) => {
                        pending.push(entry);
                        if pending.len() >= buffer_size {
                            flush(&db, &mut pending).await;
                        }
                    }
                    None => {
                        flush(&db, &mut pending).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&db, &mut pending).await;
            }
        }
    }
}

async fn flush(db: &DatabaseConnection, pending: &mut Vec<LogEntry>) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<LogEntry> = pending.drain(..).collect();
    let count = batch.len();
    if let Err(err) = write_batch(db, batch).await {
        lwarn!(
            "system",
            LogStage::Db,
            LogComponent::LogWriter,
            "flush_failed",
            "日志批量落库失败",
            batch_size = count,
            error = %err
        );
    } else {
        ldebug!(
            "system",
            LogStage::Db,
            LogComponent::LogWriter,
            "flushed",
            "日志批量落库完成",
            batch_size = count
        );
    }
}

/// 一个事务里写一批（记录先行拿主键，载荷跟随）
pub async fn write_batch(
    db: &DatabaseConnection,
    batch: Vec<LogEntry>,
) -> crate::error::Result<()> {
    let txn = db.begin().await?;
    for entry in batch {
        let now = Utc::now().naive_utc();
        let record = log_records::ActiveModel {
            request_id: Set(entry.request_id.clone()),
            user_id: Set(entry.user_id),
            token_id: Set(entry.token_id),
            channel_id: Set(entry.channel_id),
            first_channel_id: Set(entry.first_channel_id),
            model: Set(entry.model),
            dialect: Set(entry.dialect),
            is_stream: Set(entry.is_stream),
            prompt_tokens: Set(clamp_tokens(entry.usage.prompt_tokens)),
            completion_tokens: Set(clamp_tokens(entry.usage.completion_tokens)),
            cached_tokens: Set(clamp_tokens(entry.usage.cached_tokens)),
            reasoning_tokens: Set(clamp_tokens(entry.usage.reasoning_tokens)),
            image_tokens: Set(clamp_tokens(entry.usage.image_tokens)),
            total_tokens: Set(clamp_tokens(entry.usage.total_tokens)),
            quota_cost: Set(entry.quota_cost),
            usage_source: Set(entry.usage_source.as_str().to_string()),
            status: Set(entry.status),
            latency_ms: Set(entry.latency_ms),
            first_byte_ms: Set(entry.first_byte_ms),
            retry_count: Set(entry.retry_count),
            client_ip: Set(entry.client_ip),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        log_details::ActiveModel {
            record_id: Set(record.id),
            request_preview: Set(entry.request_preview),
            request_full: Set(entry.request_full),
            response_preview: Set(entry.response_preview),
            response_full: Set(entry.response_full),
            upstream_error: Set(entry.upstream_error),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
    }
    txn.commit().await?;
    Ok(())
}

fn clamp_tokens(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{Database, EntityTrait, Set};

    async fn seed_owner(db: &DatabaseConnection) -> (i32, i32) {
        let user = entity::users::Entity::insert(entity::users::ActiveModel {
            username: Set("logger".to_string()),
            group: Set("default".to_string()),
            ..Default::default()
        })
        .exec_with_returning(db)
        .await
        .unwrap();
        let token = entity::tokens::Entity::insert(entity::tokens::ActiveModel {
            user_id: Set(user.id),
            key: Set("logkey".to_string()),
            name: Set("log".to_string()),
            ..Default::default()
        })
        .exec_with_returning(db)
        .await
        .unwrap();
        (user.id, token.id)
    }

    fn entry(request_id: &str, user_id: i32, token_id: i32) -> LogEntry {
        LogEntry {
            request_id: request_id.to_string(),
            user_id,
            token_id,
            channel_id: None,
            first_channel_id: Some(1),
            model: "gpt-4o-mini".to_string(),
            dialect: "chat_completions".to_string(),
            is_stream: true,
            usage: Usage {
                prompt_tokens: 1,
                completion_tokens: 3,
                total_tokens: 4,
                ..Usage::default()
            },
            usage_source: UsageSource::Reported,
            quota_cost: 12,
            status: "ok".to_string(),
            latency_ms: 250,
            first_byte_ms: Some(80),
            retry_count: 1,
            client_ip: Some("203.0.113.9".to_string()),
            request_preview: Some("{\"model\":\"gpt-4o-mini\"}".to_string()),
            request_full: Some("{\"model\":\"gpt-4o-mini\"}".to_string()),
            response_preview: Some("ABC".to_string()),
            response_full: Some("ABC".to_string()),
            upstream_error: None,
        }
    }

    #[tokio::test]
    async fn batch_writes_record_and_detail_pair() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let (user_id, token_id) = seed_owner(&db).await;

        write_batch(
            &db,
            vec![
                entry("req-a", user_id, token_id),
                entry("req-b", user_id, token_id),
            ],
        )
        .await
        .unwrap();

        let records = log_records::Entity::find().all(&db).await.unwrap();
        let details = log_details::Entity::find().all(&db).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(details.len(), 2);

        let record = &records[0];
        assert_eq!(record.first_channel_id, Some(1));
        assert_eq!(record.channel_id, None);
        assert_eq!(record.total_tokens, 4);
        let detail = details
            .iter()
            .find(|detail| detail.record_id == record.id)
            .unwrap();
        assert_eq!(detail.response_full.as_deref(), Some("ABC"));
    }
}
