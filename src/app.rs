//! # 应用装配
//!
//! 共享资源的构建与后台任务启动：渠道注册表刷新、冷却清扫、
//! 日志写入与载荷保留期清理。

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthService;
use crate::channel::{ChannelRegistry, CooldownMap};
use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::ledger::QuotaLedger;
use crate::logs::{LogService, retention};
use crate::pricing::PricingService;
use crate::relay::transport::UpstreamTransport;

/// 进程级共享状态
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub auth: Arc<AuthService>,
    pub registry: Arc<ChannelRegistry>,
    pub cooldowns: Arc<CooldownMap>,
    pub dispatcher: Arc<Dispatcher>,
    pub ledger: Arc<QuotaLedger>,
    pub pricing: Arc<PricingService>,
    pub logs: LogService,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 构建共享状态并启动后台任务
    pub async fn build(
        config: AppConfig,
        db: DatabaseConnection,
    ) -> Result<(Arc<Self>, Vec<JoinHandle<()>>)> {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let registry = Arc::new(
            ChannelRegistry::new(
                db.clone(),
                config.relay.auto_disable_channel,
                config.relay.auto_disable_threshold,
            )
            .await?,
        );
        tasks.push(registry.start_refresh_loop(
            Duration::from_secs(config.relay.channel_refresh_seconds),
            shutdown.clone(),
        ));

        let cooldowns = Arc::new(CooldownMap::new());
        {
            let cooldowns = Arc::clone(&cooldowns);
            let cancel = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            cooldowns.sweep();
                        }
                    }
                }
            }));
        }

        let (logs, log_task) = LogService::start(
            db.clone(),
            config.relay.log_buffer_size,
            Duration::from_secs(config.relay.log_flush_seconds),
            shutdown.clone(),
        );
        tasks.push(log_task);

        tasks.push(retention::start_retention_loop(
            db.clone(),
            config.relay.detailed_log_retention_days,
            shutdown.clone(),
        ));

        let transport = Arc::new(UpstreamTransport::new()?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&cooldowns),
            transport,
            Arc::clone(&config),
        ));

        let state = Arc::new(Self {
            auth: Arc::new(AuthService::new(db.clone())),
            ledger: Arc::new(QuotaLedger::new(db.clone())),
            pricing: Arc::new(PricingService::from_env()),
            registry,
            cooldowns,
            dispatcher,
            logs,
            db,
            config,
            shutdown,
        });
        Ok((state, tasks))
    }
}
