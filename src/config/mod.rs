//! # 应用配置结构定义
//!
//! 中继核心读取的全部环境变量在此集中解析，启动时加载一次。

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{RelayError, Result};

/// 应用主配置结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 中继管道配置
    pub relay: RelayConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP监听地址
    pub host: String,
    /// HTTP监听端口
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 连接URL（sqlite / mysql / postgres）
    pub url: String,
    /// 连接池上限
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/relay.db?mode=rwc".to_string(),
            max_connections: 32,
        }
    }
}

/// 中继管道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 非流式请求的总墙钟超时（秒）
    pub relay_timeout: u64,
    /// 流式请求的总墙钟超时（秒）
    pub stream_relay_timeout: u64,
    /// 单请求最大尝试次数
    pub max_retries: u32,
    /// 可重试失败后 (渠道, 模型) 的默认冷却（秒）
    pub retry_cooldown_seconds: u64,
    /// 渠道级致命错误触发自动禁用
    pub auto_disable_channel: bool,
    /// 连续致命错误达到此值后禁用
    pub auto_disable_threshold: u32,
    /// log_details 保留天数，<=0 关闭清理
    pub detailed_log_retention_days: i64,
    /// 预扣估算用的输出 token 上限兜底
    pub max_output_tokens_default: u32,
    /// 上游到客户端事件通道容量
    pub stream_buffer_events: usize,
    /// 流式中途断开按全额计费（false 则按已交付估算）
    pub debit_partial_stream_in_full: bool,
    /// 渠道注册表刷新间隔（秒）
    pub channel_refresh_seconds: u64,
    /// 日志落库批量条数
    pub log_buffer_size: usize,
    /// 日志落库刷新间隔（秒）
    pub log_flush_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_timeout: 300,
            stream_relay_timeout: 900,
            max_retries: 3,
            retry_cooldown_seconds: 60,
            auto_disable_channel: true,
            auto_disable_threshold: 1,
            detailed_log_retention_days: 7,
            max_output_tokens_default: 4096,
            stream_buffer_events: 64,
            debit_partial_stream_in_full: true,
            channel_refresh_seconds: 60,
            log_buffer_size: 64,
            log_flush_seconds: 5,
        }
    }
}

impl RelayConfig {
    /// 请求的墙钟超时
    #[must_use]
    pub fn request_timeout(&self, is_stream: bool) -> Duration {
        if is_stream {
            Duration::from_secs(self.stream_relay_timeout)
        } else {
            Duration::from_secs(self.relay_timeout)
        }
    }

    /// 默认冷却时长
    #[must_use]
    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_seconds)
    }
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        let defaults = RelayConfig::default();
        let relay = RelayConfig {
            relay_timeout: env_parse("RELAY_TIMEOUT", defaults.relay_timeout)?,
            stream_relay_timeout: env_parse(
                "STREAM_RELAY_TIMEOUT",
                defaults.stream_relay_timeout,
            )?,
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries)?,
            retry_cooldown_seconds: env_parse(
                "RETRY_COOLDOWN_SECONDS",
                defaults.retry_cooldown_seconds,
            )?,
            auto_disable_channel: env_parse(
                "AUTO_DISABLE_CHANNEL",
                defaults.auto_disable_channel,
            )?,
            auto_disable_threshold: env_parse(
                "AUTO_DISABLE_THRESHOLD",
                defaults.auto_disable_threshold,
            )?,
            detailed_log_retention_days: env_parse(
                "DETAILED_LOG_RETENTION_DAYS",
                defaults.detailed_log_retention_days,
            )?,
            max_output_tokens_default: env_parse(
                "MAX_OUTPUT_TOKENS_DEFAULT",
                defaults.max_output_tokens_default,
            )?,
            stream_buffer_events: env_parse(
                "STREAM_BUFFER_EVENTS",
                defaults.stream_buffer_events,
            )?,
            debit_partial_stream_in_full: env_parse(
                "DEBIT_PARTIAL_STREAM_IN_FULL",
                defaults.debit_partial_stream_in_full,
            )?,
            channel_refresh_seconds: env_parse(
                "CHANNEL_REFRESH_SECONDS",
                defaults.channel_refresh_seconds,
            )?,
            log_buffer_size: env_parse("LOG_BUFFER_SIZE", defaults.log_buffer_size)?,
            log_flush_seconds: env_parse("LOG_FLUSH_SECONDS", defaults.log_flush_seconds)?,
        };

        let server_defaults = ServerConfig::default();
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or(server_defaults.host),
            port: env_parse("PORT", server_defaults.port)?,
        };

        let db_defaults = DatabaseConfig::default();
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").unwrap_or(db_defaults.url),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", db_defaults.max_connections)?,
        };

        let config = Self {
            server,
            database,
            relay,
        };
        config.validate()?;
        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.relay.max_retries == 0 {
            return Err(RelayError::config("MAX_RETRIES 必须大于 0"));
        }
        if self.relay.stream_buffer_events == 0 {
            return Err(RelayError::config("STREAM_BUFFER_EVENTS 必须大于 0"));
        }
        if self.database.url.is_empty() {
            return Err(RelayError::config("DATABASE_URL 不能为空"));
        }
        Ok(())
    }
}

/// 读取并解析环境变量，缺失时取默认值
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| {
            RelayError::config(format!("环境变量 {key} 解析失败: {e}"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let relay = RelayConfig::default();
        assert_eq!(relay.request_timeout(false), Duration::from_secs(300));
        assert_eq!(relay.request_timeout(true), Duration::from_secs(900));
        assert_eq!(relay.retry_cooldown(), Duration::from_secs(60));
        assert!(relay.debit_partial_stream_in_full);
        assert_eq!(relay.auto_disable_threshold, 1);
    }

    #[test]
    fn zero_retries_rejected() {
        let mut config = AppConfig {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            relay: RelayConfig::default(),
        };
        config.relay.max_retries = 0;
        assert!(config.validate().is_err());
    }
}
