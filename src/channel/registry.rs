//! # 渠道注册表
//!
//! 进程级读多写少快照：定时或显式失效时从存储整体重载，
//! 写方（自动禁用、刷新）发布新快照。候选过滤在内存完成。

use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use entity::channels::{self, CHANNEL_STATUS_AUTO_DISABLED, Entity as Channels};

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::relay::codec::ChannelFamily;
use crate::types::ChannelId;
use crate::{ldebug, linfo, lwarn};

use super::CooldownMap;

/// 渠道的内存视图；从实体解析出的集合与映射只算一次
#[derive(Debug, Clone)]
pub struct ChannelMeta {
    pub id: ChannelId,
    pub name: String,
    pub family: ChannelFamily,
    pub base_url: String,
    pub keys: Vec<String>,
    pub priority: i64,
    pub weight: i64,
    pub models: HashSet<String>,
    pub model_mapping: HashMap<String, String>,
    pub groups: HashSet<String>,
    pub header_override: HashMap<String, String>,
    pub pass_through: bool,
}

impl ChannelMeta {
    /// 实体 -> 内存视图；family 非法的渠道被调用方跳过
    pub fn from_model(model: &channels::Model) -> Result<Self> {
        let keys: Vec<String> = model
            .key
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            id: model.id,
            name: model.name.clone(),
            family: ChannelFamily::parse(&model.family)?,
            base_url: model.base_url.clone(),
            keys,
            priority: model.priority,
            weight: model.weight.max(0),
            models: model.model_list().into_iter().collect(),
            model_mapping: model.model_mapping_table(),
            groups: model.group_list().into_iter().collect(),
            header_override: model.header_override_table(),
            pass_through: model.pass_through,
        })
    }

    /// 从密钥池随机取一把；池为空返回空串（构造时已过滤）
    #[must_use]
    pub fn pick_key(&self) -> &str {
        match self.keys.len() {
            0 => "",
            1 => &self.keys[0],
            len => {
                let index = rand::thread_rng().gen_range(0..len);
                &self.keys[index]
            }
        }
    }

    /// 客户端模型名经渠道重写表映射为上游名
    #[must_use]
    pub fn resolve_model(&self, requested: &str) -> String {
        self.model_mapping
            .get(requested)
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    }

    #[must_use]
    pub fn serves_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    #[must_use]
    pub fn serves_any_group(&self, groups: &[String]) -> bool {
        groups.iter().any(|group| self.groups.contains(group))
    }
}

/// 渠道注册表
pub struct ChannelRegistry {
    db: DatabaseConnection,
    snapshot: RwLock<Arc<Vec<Arc<ChannelMeta>>>>,
    /// 连续致命错误计数；成功清零
    fatal_counts: Mutex<HashMap<ChannelId, u32>>,
    auto_disable: bool,
    auto_disable_threshold: u32,
}

impl ChannelRegistry {
    /// 建表并做首次加载
    pub async fn new(
        db: DatabaseConnection,
        auto_disable: bool,
        auto_disable_threshold: u32,
    ) -> Result<Self> {
        let registry = Self {
            db,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            fatal_counts: Mutex::new(HashMap::new()),
            auto_disable,
            auto_disable_threshold: auto_disable_threshold.max(1),
        };
        registry.refresh().await?;
        Ok(registry)
    }

    /// 从存储整体重载启用渠道并发布新快照
    pub async fn refresh(&self) -> Result<usize> {
        let models = Channels::find()
            .filter(channels::Column::Status.eq(channels::CHANNEL_STATUS_ENABLED))
            .all(&self.db)
            .await?;

        let mut metas = Vec::with_capacity(models.len());
        for model in &models {
            match ChannelMeta::from_model(model) {
                Ok(meta) => metas.push(Arc::new(meta)),
                Err(err) => {
                    lwarn!(
                        "system",
                        LogStage::Configuration,
                        LogComponent::Registry,
                        "channel_skipped",
                        "渠道配置非法，已跳过",
                        channel_id = model.id,
                        error = %err
                    );
                }
            }
        }
        let count = metas.len();
        *self.snapshot.write().unwrap() = Arc::new(metas);
        ldebug!(
            "system",
            LogStage::Configuration,
            LogComponent::Registry,
            "registry_refreshed",
            "渠道注册表已刷新",
            channel_count = count
        );
        Ok(count)
    }

    /// 当前快照
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<ChannelMeta>>> {
        self.snapshot.read().unwrap().clone()
    }

    /// 候选渠道：分组相交、模型覆盖、冷却已过
    #[must_use]
    pub fn candidates(
        &self,
        model: &str,
        groups: &[String],
        cooldowns: &CooldownMap,
    ) -> Vec<Arc<ChannelMeta>> {
        self.snapshot()
            .iter()
            .filter(|channel| channel.serves_model(model))
            .filter(|channel| channel.serves_any_group(groups))
            .filter(|channel| !cooldowns.is_active(channel.id, model))
            .cloned()
            .collect()
    }

    /// 尝试成功后清零致命计数
    pub fn record_success(&self, channel_id: ChannelId) {
        self.fatal_counts.lock().unwrap().remove(&channel_id);
    }

    /// 记录一次渠道级致命错误。
    ///
    /// 连续次数达到阈值且开启自动禁用时，写库置为自动禁用
    /// 并当场从快照摘除；返回是否触发了禁用。
    pub async fn record_fatal(&self, channel_id: ChannelId, request_id: &str) -> Result<bool> {
        let reached = {
            let mut counts = self.fatal_counts.lock().unwrap();
            let count = counts.entry(channel_id).or_insert(0);
            *count += 1;
            *count >= self.auto_disable_threshold
        };
        if !reached || !self.auto_disable {
            return Ok(false);
        }

        Channels::update_many()
            .col_expr(
                channels::Column::Status,
                Expr::value(CHANNEL_STATUS_AUTO_DISABLED),
            )
            .filter(channels::Column::Id.eq(channel_id))
            .exec(&self.db)
            .await?;
        self.fatal_counts.lock().unwrap().remove(&channel_id);

        {
            let mut snapshot = self.snapshot.write().unwrap();
            let remaining: Vec<Arc<ChannelMeta>> = snapshot
                .iter()
                .filter(|channel| channel.id != channel_id)
                .cloned()
                .collect();
            *snapshot = Arc::new(remaining);
        }
        linfo!(
            request_id,
            LogStage::Scheduling,
            LogComponent::Registry,
            "channel_auto_disabled",
            "渠道因连续致命错误被自动禁用",
            channel_id = channel_id
        );
        Ok(true)
    }

    /// 后台定时刷新
    pub fn start_refresh_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = registry.refresh().await {
                            lwarn!(
                                "system",
                                LogStage::BackgroundTask,
                                LogComponent::Registry,
                                "refresh_failed",
                                "渠道注册表刷新失败",
                                error = %err
                            );
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{Database, Set};

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        db
    }

    async fn insert_channel(
        db: &DatabaseConnection,
        name: &str,
        family: &str,
        models: &str,
        groups: &str,
        status: i32,
    ) -> ChannelId {
        let result = Channels::insert(channels::ActiveModel {
            name: Set(name.to_string()),
            family: Set(family.to_string()),
            base_url: Set("https://api.example.com".to_string()),
            key: Set("sk-a,sk-b".to_string()),
            status: Set(status),
            priority: Set(0),
            weight: Set(1),
            models: Set(models.to_string()),
            groups: Set(groups.to_string()),
            ..Default::default()
        })
        .exec(db)
        .await
        .unwrap();
        result.last_insert_id
    }

    #[tokio::test]
    async fn candidates_filter_by_model_group_and_status() {
        let db = setup_db().await;
        insert_channel(&db, "a", "openai", "gpt-4o,gpt-4o-mini", "default", 1).await;
        insert_channel(&db, "b", "claude", "claude-3-5-sonnet", "vip", 1).await;
        insert_channel(&db, "c", "openai", "gpt-4o", "default", 2).await;

        let registry = ChannelRegistry::new(db, true, 1).await.unwrap();
        let cooldowns = CooldownMap::new();

        let hits = registry.candidates("gpt-4o", &["default".to_string()], &cooldowns);
        // 手动禁用的渠道不入快照
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "a");

        let hits = registry.candidates(
            "claude-3-5-sonnet",
            &["default".to_string()],
            &cooldowns,
        );
        assert!(hits.is_empty());

        let hits = registry.candidates("claude-3-5-sonnet", &["vip".to_string()], &cooldowns);
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn cooldown_excludes_candidate() {
        let db = setup_db().await;
        let id = insert_channel(&db, "a", "openai", "gpt-4o", "default", 1).await;
        let registry = ChannelRegistry::new(db, true, 1).await.unwrap();
        let cooldowns = CooldownMap::new();

        cooldowns.set(id, "gpt-4o", Duration::from_secs(60));
        assert!(registry
            .candidates("gpt-4o", &["default".to_string()], &cooldowns)
            .is_empty());
    }

    #[tokio::test]
    async fn fatal_threshold_auto_disables_channel() {
        let db = setup_db().await;
        let id = insert_channel(&db, "a", "openai", "gpt-4o", "default", 1).await;
        let registry = ChannelRegistry::new(db.clone(), true, 2).await.unwrap();

        assert!(!registry.record_fatal(id, "req-1").await.unwrap());
        assert!(registry.record_fatal(id, "req-1").await.unwrap());

        // 快照即时摘除
        assert!(registry.snapshot().is_empty());
        // 存储状态落库
        let stored = Channels::find_by_id(id).one(&db).await.unwrap().unwrap();
        assert_eq!(stored.status, CHANNEL_STATUS_AUTO_DISABLED);
    }

    #[tokio::test]
    async fn success_resets_fatal_count() {
        let db = setup_db().await;
        let id = insert_channel(&db, "a", "openai", "gpt-4o", "default", 1).await;
        let registry = ChannelRegistry::new(db, true, 2).await.unwrap();

        assert!(!registry.record_fatal(id, "req-1").await.unwrap());
        registry.record_success(id);
        assert!(!registry.record_fatal(id, "req-1").await.unwrap());
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn model_mapping_resolves_alias() {
        let meta = ChannelMeta {
            id: 1,
            name: "test".into(),
            family: ChannelFamily::OpenAi,
            base_url: String::new(),
            keys: vec!["sk-a".into()],
            priority: 0,
            weight: 1,
            models: HashSet::new(),
            model_mapping: HashMap::from([(
                "gpt-4o".to_string(),
                "gpt-4o-2024-08-06".to_string(),
            )]),
            groups: HashSet::new(),
            header_override: HashMap::new(),
            pass_through: false,
        };
        assert_eq!(meta.resolve_model("gpt-4o"), "gpt-4o-2024-08-06");
        assert_eq!(meta.resolve_model("gpt-4o-mini"), "gpt-4o-mini");
    }
}
