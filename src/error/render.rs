//! # 错误响应渲染
//!
//! 失败响应按客户端选择的方言成形；上游原始错误体永不透出
//! （渠道显式配置透传模式时由中继层另行处理）。

use serde_json::{Value, json};

use super::RelayError;
use crate::relay::codec::ApiDialect;

/// 按入站方言渲染客户端可见的错误体
#[must_use]
pub fn render_error_body(err: &RelayError, dialect: ApiDialect) -> Value {
    let message = client_message(err);
    match dialect {
        ApiDialect::ClaudeMessages => json!({
            "type": "error",
            "error": {
                "type": claude_error_type(err),
                "message": message,
            }
        }),
        ApiDialect::GeminiGenerateContent => json!({
            "error": {
                "code": err.status_code().as_u16(),
                "message": message,
                "status": gemini_status(err),
            }
        }),
        _ => json!({
            "error": {
                "message": message,
                "type": err.error_type(),
                "code": err.log_status(),
            }
        }),
    }
}

/// 客户端可见文案；上游细节被归一化
fn client_message(err: &RelayError) -> String {
    match err {
        RelayError::InvalidRequest { message } => message.clone(),
        RelayError::Unauthorized { message } => message.clone(),
        RelayError::ForbiddenModel { model } => {
            format!("you are not allowed to use model {model}")
        }
        RelayError::ForbiddenGroup { group } => {
            format!("you are not allowed to use group {group}")
        }
        RelayError::InsufficientQuota => "insufficient quota".to_string(),
        RelayError::NoChannel { model } => {
            format!("no available channel for model {model}")
        }
        RelayError::ChannelRetryable { .. } | RelayError::ChannelFatal { .. } => {
            "upstream provider error, please retry later".to_string()
        }
        RelayError::ClientCancelled => "client closed the connection".to_string(),
        RelayError::Database { .. } | RelayError::Config { .. } | RelayError::Internal { .. } => {
            "internal server error".to_string()
        }
    }
}

fn claude_error_type(err: &RelayError) -> &'static str {
    match err {
        RelayError::InvalidRequest { .. } => "invalid_request_error",
        RelayError::Unauthorized { .. } => "authentication_error",
        RelayError::ForbiddenModel { .. } | RelayError::ForbiddenGroup { .. } => {
            "permission_error"
        }
        RelayError::InsufficientQuota => "rate_limit_error",
        RelayError::NoChannel { .. }
        | RelayError::ChannelRetryable { .. }
        | RelayError::ChannelFatal { .. } => "overloaded_error",
        _ => "api_error",
    }
}

fn gemini_status(err: &RelayError) -> &'static str {
    match err {
        RelayError::InvalidRequest { .. } => "INVALID_ARGUMENT",
        RelayError::Unauthorized { .. } => "UNAUTHENTICATED",
        RelayError::ForbiddenModel { .. } | RelayError::ForbiddenGroup { .. } => {
            "PERMISSION_DENIED"
        }
        RelayError::InsufficientQuota => "RESOURCE_EXHAUSTED",
        RelayError::NoChannel { .. }
        | RelayError::ChannelRetryable { .. }
        | RelayError::ChannelFatal { .. } => "UNAVAILABLE",
        _ => "INTERNAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_dialect_uses_error_object() {
        let body = render_error_body(
            &RelayError::InsufficientQuota,
            ApiDialect::ChatCompletions,
        );
        assert_eq!(body["error"]["type"], "insufficient_quota");
        assert_eq!(body["error"]["message"], "insufficient quota");
    }

    #[test]
    fn claude_dialect_wraps_type_error() {
        let body = render_error_body(
            &RelayError::unauthorized("invalid api key"),
            ApiDialect::ClaudeMessages,
        );
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[test]
    fn upstream_detail_is_not_leaked() {
        let err = RelayError::channel_fatal("upstream said: key sk-secret is bad", Some(401));
        let body = render_error_body(&err, ApiDialect::ChatCompletions);
        let text = body.to_string();
        assert!(!text.contains("sk-secret"));
    }
}
