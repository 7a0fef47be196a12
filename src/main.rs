//! # AI API 网关中继服务
//!
//! 进程入口：加载配置、连库迁移、装配共享状态、启动中继服务器。

use relay_gateway::logging::{LogComponent, LogStage};
use relay_gateway::{AppConfig, linfo};

#[tokio::main]
async fn main() -> relay_gateway::Result<()> {
    relay_gateway::logging::init_logging();

    let config = AppConfig::from_env()?;
    let db = relay_gateway::database::init_database(&config.database).await?;
    relay_gateway::database::run_migrations(&db).await?;

    let (state, tasks) = relay_gateway::app::AppState::build(config, db).await?;

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            linfo!(
                "system",
                LogStage::Shutdown,
                LogComponent::Main,
                "shutdown_signal",
                "收到中断信号，开始优雅退出"
            );
            shutdown.cancel();
        }
    });

    relay_gateway::relay::server::serve(state).await?;

    // 给后台任务（日志冲刷等）留出收尾窗口
    for task in tasks {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
    }
    Ok(())
}
