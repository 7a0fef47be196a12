//! # 数据库初始化模块

use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::linfo;

/// 建立数据库连接池
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(options).await?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "db_connected",
        "数据库连接成功"
    );
    Ok(db)
}

/// 执行未应用的迁移
pub async fn run_migrations(db: &DatabaseConnection) -> Result<()> {
    Migrator::up(db, None).await?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "migrations_applied",
        "数据库迁移完成"
    );
    Ok(())
}
