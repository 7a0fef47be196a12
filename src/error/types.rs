//! # 错误类型定义
//!
//! 管道内只有一套错误类别；每个类别自带 HTTP 状态、重试分类与日志状态串。

use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// 管道主要错误类型
#[derive(Debug, Error)]
pub enum RelayError {
    /// 入站请求非法：请求体损坏、未知模型、方言不支持
    #[error("无效请求: {message}")]
    InvalidRequest { message: String },

    /// 令牌缺失或无效
    #[error("鉴权失败: {message}")]
    Unauthorized { message: String },

    /// 令牌或用户无权使用该模型
    #[error("无权访问模型: {model}")]
    ForbiddenModel { model: String },

    /// 令牌或用户无权访问该分组
    #[error("无权访问分组: {group}")]
    ForbiddenGroup { group: String },

    /// 预扣配额被拒
    #[error("配额不足")]
    InsufficientQuota,

    /// 过滤与冷却后候选渠道为空
    #[error("无可用渠道: {model}")]
    NoChannel { model: String },

    /// 上游可重试失败：429、无致命提示的 5xx、网络超时与连接中断
    #[error("渠道暂时不可用: {message}")]
    ChannelRetryable {
        message: String,
        status: Option<u16>,
        /// 需要附加冷却时写入
        cooldown: Option<Duration>,
    },

    /// 上游致命失败：401/403、模型不存在、服务商配额耗尽
    #[error("渠道不可用: {message}")]
    ChannelFatal {
        message: String,
        status: Option<u16>,
    },

    /// 入站客户端断开连接
    #[error("客户端已断开")]
    ClientCancelled,

    /// 数据库错误
    #[error("数据库错误: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 配置错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 程序内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// 调度器视角的重试分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// 立即换渠道重试
    RetryableNow,
    /// 换渠道重试并对 (渠道, 模型) 冷却
    RetryableWithCooldown,
    /// 渠道级致命：触发自动禁用后继续重试其他渠道
    FatalChannel,
    /// 请求级致命：终止重试
    FatalRequest,
}

impl RelayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn retryable(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::ChannelRetryable {
            message: message.into(),
            status,
            cooldown: None,
        }
    }

    pub fn retryable_with_cooldown(
        message: impl Into<String>,
        status: Option<u16>,
        cooldown: Duration,
    ) -> Self {
        Self::ChannelRetryable {
            message: message.into(),
            status,
            cooldown: Some(cooldown),
        }
    }

    pub fn channel_fatal(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::ChannelFatal {
            message: message.into(),
            status,
        }
    }

    /// 客户端可见的 HTTP 状态
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::ForbiddenModel { .. } | Self::ForbiddenGroup { .. } => StatusCode::FORBIDDEN,
            Self::InsufficientQuota => StatusCode::PAYMENT_REQUIRED,
            Self::NoChannel { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ChannelRetryable { .. } | Self::ChannelFatal { .. } => StatusCode::BAD_GATEWAY,
            Self::ClientCancelled => StatusCode::BAD_REQUEST,
            Self::Database { .. } | Self::Config { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 调度器的重试分类
    #[must_use]
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::ChannelRetryable { cooldown, .. } => {
                if cooldown.is_some() {
                    RetryClass::RetryableWithCooldown
                } else {
                    RetryClass::RetryableNow
                }
            }
            Self::ChannelFatal { .. } => RetryClass::FatalChannel,
            _ => RetryClass::FatalRequest,
        }
    }

    /// 写入 `log_records.status` 的状态串
    #[must_use]
    pub fn log_status(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Unauthorized { .. } => "unauthorized",
            Self::ForbiddenModel { .. } => "forbidden_model",
            Self::ForbiddenGroup { .. } => "forbidden_group",
            Self::InsufficientQuota => "insufficient_quota",
            Self::NoChannel { .. } => "no_channel",
            Self::ChannelRetryable { .. } => "channel_retryable",
            Self::ChannelFatal { .. } => "channel_fatal",
            Self::ClientCancelled => "client_cancelled",
            Self::Database { .. } | Self::Config { .. } | Self::Internal { .. } => "internal",
        }
    }

    /// 失败时是否退款（已交付部分流量的请求不退）
    #[must_use]
    pub fn refunds_pre_charge(&self) -> bool {
        !matches!(self, Self::ClientCancelled)
    }

    /// OpenAI 风格错误类别串
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::Unauthorized { .. } => "authentication_error",
            Self::ForbiddenModel { .. } | Self::ForbiddenGroup { .. } => "permission_error",
            Self::InsufficientQuota => "insufficient_quota",
            Self::NoChannel { .. }
            | Self::ChannelRetryable { .. }
            | Self::ChannelFatal { .. } => "upstream_error",
            Self::ClientCancelled => "client_cancelled",
            Self::Database { .. } | Self::Config { .. } | Self::Internal { .. } => "api_error",
        }
    }
}

impl From<sea_orm::DbErr> for RelayError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::Database {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        Self::Config {
            message: format!("URL 解析失败: {err}"),
            source: Some(err.into()),
        }
    }
}
