//! # 上游传输
//!
//! 绑定单次尝试的轻 HTTP 客户端：URL 拼接、头部卫生、
//! 截止时间与流式判定。网络错误与 HTTP 错误状态分开归类。

use bytes::Bytes;
use futures::Stream;
use http::{HeaderMap, HeaderName, HeaderValue, header};
use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::codec::{ChannelFamily, UpstreamRequestBody, UpstreamRequestParts};
use crate::error::{RelayError, Result};

/// RFC 7230 逐跳头与端到端不兼容头；透传模式下必须剥除
const STRIP_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "api-key",
    "x-api-key",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "host",
    "content-length",
];

/// 上游响应体
pub enum UpstreamBody {
    Buffered(Bytes),
    Stream(Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>),
}

/// 一次成功尝试的上游响应
pub struct UpstreamReply {
    pub status: http::StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
    pub is_stream: bool,
}

/// 上游 URL 拼接。
///
/// OpenAI 线格式：base 无路径（或仅 `/`）时保留 `/v1` 前缀；
/// base 带路径时剥除请求 URL 的 `/v1` 前缀。Cloudflare AI
/// gateway 的形状优先识别。非 OpenAI 渠道从不剥 `/v1`。
pub fn build_upstream_url(
    base_url: &str,
    request_url: &str,
    family: ChannelFamily,
) -> Result<String> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(RelayError::config("base_url 不能为空"));
    }
    let absolute = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    if family.is_openai_wire() {
        if absolute.contains("gateway.ai.cloudflare.com") {
            let suffix = request_url.strip_prefix("/v1").unwrap_or(request_url);
            return Ok(format!("{absolute}{suffix}"));
        }
        let parsed = url::Url::parse(&absolute)?;
        let has_path = !matches!(parsed.path(), "" | "/");
        if has_path {
            let suffix = request_url.strip_prefix("/v1").unwrap_or(request_url);
            return Ok(format!("{absolute}{suffix}"));
        }
    }
    Ok(format!("{absolute}{request_url}"))
}

/// 透传模式的剥除集合：固定名单 + 入站 `Connection` 声明的逐跳头 + 附加名单
#[must_use]
pub fn build_pass_through_deny_set(
    inbound: &HeaderMap,
    extra_deny: &[&str],
) -> HashSet<String> {
    let mut deny: HashSet<String> = STRIP_HEADERS.iter().map(|s| (*s).to_string()).collect();
    for value in inbound.get_all(header::CONNECTION) {
        if let Ok(tokens) = value.to_str() {
            for token in tokens.split(',') {
                let token = token.trim().to_ascii_lowercase();
                if !token.is_empty() {
                    deny.insert(token);
                }
            }
        }
    }
    for name in extra_deny {
        deny.insert(name.to_ascii_lowercase());
    }
    deny
}

/// 复制入站头，跳过剥除集合中的名字（保留重复值）
pub fn copy_headers_except(dst: &mut HeaderMap, src: &HeaderMap, deny: &HashSet<String>) {
    for (name, value) in src {
        if deny.contains(name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// 头部覆盖模板的解析结果
#[derive(Debug, Default)]
pub struct ResolvedOverrides {
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// 模板含 `"*": ""` 时抑制客户端头透传
    pub suppress_client_headers: bool,
}

/// 解析头部覆盖模板。
///
/// 占位符是封闭集合：`{client_header:H}`、`{channel_key}`、
/// `{request_id}`；未知占位符按配置错误处理。渠道连通性测试
/// 请求中 client_header 占位符解析为空并跳过该头。
pub fn resolve_header_overrides(
    templates: &std::collections::HashMap<String, String>,
    inbound: &HeaderMap,
    channel_key: &str,
    request_id: &str,
    is_channel_test: bool,
) -> Result<ResolvedOverrides> {
    let mut resolved = ResolvedOverrides::default();
    for (name, template) in templates {
        if name == "*" {
            if !is_channel_test && template.is_empty() {
                resolved.suppress_client_headers = true;
            }
            continue;
        }
        let Some(value) =
            resolve_template(template, inbound, channel_key, request_id, is_channel_test)?
        else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RelayError::config(format!("头部覆盖名非法 {name}: {e}")))?;
        let header_value = HeaderValue::from_str(&value)
            .map_err(|e| RelayError::config(format!("头部覆盖值非法 {name}: {e}")))?;
        resolved.headers.push((header_name, header_value));
    }
    Ok(resolved)
}

/// 单模板展开；渠道测试中遇到 client_header 占位符返回 None
fn resolve_template(
    template: &str,
    inbound: &HeaderMap,
    channel_key: &str,
    request_id: &str,
    is_channel_test: bool,
) -> Result<Option<String>> {
    let mut output = String::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        output.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('}') else {
            return Err(RelayError::config(format!("头部覆盖模板未闭合: {template}")));
        };
        let placeholder = &rest[start + 1..start + end];
        if let Some(header_name) = placeholder.strip_prefix("client_header:") {
            if is_channel_test {
                return Ok(None);
            }
            let value = HeaderName::from_bytes(header_name.trim().as_bytes())
                .ok()
                .and_then(|name| inbound.get(&name))
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            output.push_str(value);
        } else {
            match placeholder {
                "channel_key" => output.push_str(channel_key),
                "request_id" => output.push_str(request_id),
                other => {
                    return Err(RelayError::config(format!(
                        "未知头部覆盖占位符: {{{other}}}"
                    )));
                }
            }
        }
        rest = &rest[start + end + 1..];
    }
    output.push_str(rest);
    Ok(Some(output))
}

/// 上游状态码分类：致命渠道错误触发自动禁用，可重试错误附带冷却
pub fn classify_upstream_status(
    status: http::StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    default_cooldown: Duration,
) -> RelayError {
    let body_text = String::from_utf8_lossy(body);
    let snippet: String = body_text.chars().take(2048).collect();

    if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
        return RelayError::channel_fatal(
            format!("上游鉴权失败 {status}: {snippet}"),
            Some(status.as_u16()),
        );
    }
    if status == http::StatusCode::NOT_FOUND {
        return RelayError::channel_fatal(
            format!("上游模型或路径不存在: {snippet}"),
            Some(status.as_u16()),
        );
    }
    if status == http::StatusCode::TOO_MANY_REQUESTS {
        let cooldown = retry_after_seconds(headers)
            .map(Duration::from_secs)
            .unwrap_or(default_cooldown);
        return RelayError::retryable_with_cooldown(
            format!("上游限流: {snippet}"),
            Some(status.as_u16()),
            cooldown,
        );
    }
    if status.is_server_error() {
        return RelayError::retryable_with_cooldown(
            format!("上游服务错误 {status}: {snippet}"),
            Some(status.as_u16()),
            default_cooldown,
        );
    }
    // 服务商配额耗尽在 4xx 里以错误体标识
    let lowered = snippet.to_ascii_lowercase();
    if lowered.contains("insufficient_quota")
        || lowered.contains("quota exceeded")
        || lowered.contains("billing")
    {
        return RelayError::channel_fatal(
            format!("上游配额耗尽: {snippet}"),
            Some(status.as_u16()),
        );
    }
    RelayError::invalid_request(format!("上游拒绝请求 {status}: {snippet}"))
}

fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// 上游传输客户端；进程内共享连接池
pub struct UpstreamTransport {
    client: reqwest::Client,
}

impl UpstreamTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| RelayError::internal_with_source("HTTP 客户端构建失败", e))?;
        Ok(Self { client })
    }

    /// 执行一次上游尝试。
    ///
    /// `remaining` 是请求级截止时间的剩余量；取消令牌触发时
    /// 中止等待并返回客户端断开。
    pub async fn execute(
        &self,
        parts: UpstreamRequestParts,
        remaining: Duration,
        cancel: &CancellationToken,
        default_cooldown: Duration,
    ) -> Result<UpstreamReply> {
        let mut builder = self
            .client
            .request(parts.method, &parts.url)
            .headers(parts.headers)
            .timeout(remaining);
        builder = match parts.body {
            UpstreamRequestBody::Json(value) => builder.json(&value),
            UpstreamRequestBody::Binary {
                bytes,
                content_type,
            } => builder
                .header(header::CONTENT_TYPE, content_type)
                .body(bytes),
        };

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(RelayError::ClientCancelled),
            result = builder.send() => result.map_err(classify_network_error)?,
        };

        let status = response.status();
        let headers = response.headers().clone();

        if !status.is_success() {
            let body = tokio::select! {
                () = cancel.cancelled() => return Err(RelayError::ClientCancelled),
                result = response.bytes() => result.map_err(classify_network_error)?,
            };
            return Err(classify_upstream_status(
                status,
                &headers,
                &body,
                default_cooldown,
            ));
        }

        let is_stream = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            Ok(UpstreamReply {
                status,
                headers,
                body: UpstreamBody::Stream(Box::pin(response.bytes_stream())),
                is_stream: true,
            })
        } else {
            let body = tokio::select! {
                () = cancel.cancelled() => return Err(RelayError::ClientCancelled),
                result = response.bytes() => result.map_err(classify_network_error)?,
            };
            Ok(UpstreamReply {
                status,
                headers,
                body: UpstreamBody::Buffered(body),
                is_stream: false,
            })
        }
    }
}

/// 网络层错误一律可重试；超时与连接中断同类
fn classify_network_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::retryable(format!("上游请求超时: {err}"), None)
    } else {
        RelayError::retryable(format!("上游网络错误: {err}"), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_url_rule_matches_contract() {
        // base 无路径保留 /v1
        assert_eq!(
            build_upstream_url("https://api.openai.com", "/v1/chat/completions", ChannelFamily::OpenAi)
                .unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
        // 尾随斜杠视同无路径
        assert_eq!(
            build_upstream_url("https://api.openai.com/", "/v1/chat/completions", ChannelFamily::OpenAi)
                .unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
        // base 带路径剥 /v1
        assert_eq!(
            build_upstream_url("https://api.openai.com/v2", "/v1/chat/completions", ChannelFamily::OpenAi)
                .unwrap(),
            "https://api.openai.com/v2/chat/completions"
        );
        assert_eq!(
            build_upstream_url("https://api.openai.com/v2/", "/v1/chat/completions", ChannelFamily::OpenAi)
                .unwrap(),
            "https://api.openai.com/v2/chat/completions"
        );
        // 非 OpenAI 渠道从不剥 /v1
        assert_eq!(
            build_upstream_url("https://openrouter.ai/api", "/v1/chat/completions", ChannelFamily::Claude)
                .unwrap(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn cloudflare_gateway_shape_is_recognized() {
        assert_eq!(
            build_upstream_url(
                "https://gateway.ai.cloudflare.com/account/gateway/openai",
                "/v1/chat/completions",
                ChannelFamily::OpenAi,
            )
            .unwrap(),
            "https://gateway.ai.cloudflare.com/account/gateway/openai/chat/completions"
        );
    }

    #[test]
    fn deny_set_filters_auth_hop_by_hop_and_connection_tokens() {
        let mut src = HeaderMap::new();
        src.insert("x-trace-id", HeaderValue::from_static("abc"));
        src.append("x-multi", HeaderValue::from_static("a"));
        src.append("x-multi", HeaderValue::from_static("b"));
        src.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer user"));
        src.insert("api-key", HeaderValue::from_static("user-key"));
        src.insert("x-api-key", HeaderValue::from_static("user-x-key"));
        src.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        src.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        src.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        src.insert(header::HOST, HeaderValue::from_static("example.com"));
        src.insert(header::CONTENT_LENGTH, HeaderValue::from_static("123"));
        src.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        src.insert(header::PROXY_AUTHENTICATE, HeaderValue::from_static("Basic"));
        src.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        src.insert(header::TE, HeaderValue::from_static("trailers"));
        src.insert(header::TRAILER, HeaderValue::from_static("Foo"));
        src.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        src.append(header::CONNECTION, HeaderValue::from_static("X-Hop, keep-alive"));
        src.insert("x-hop", HeaderValue::from_static("1"));

        let deny = build_pass_through_deny_set(&src, &[]);
        let mut dst = HeaderMap::new();
        copy_headers_except(&mut dst, &src, &deny);

        assert_eq!(dst.get("x-trace-id").unwrap(), "abc");
        let multi: Vec<_> = dst.get_all("x-multi").iter().collect();
        assert_eq!(multi.len(), 2);

        for name in [
            "authorization",
            "api-key",
            "x-api-key",
            "cookie",
            "connection",
            "keep-alive",
            "proxy-authenticate",
            "proxy-authorization",
            "te",
            "trailer",
            "transfer-encoding",
            "upgrade",
            "proxy-connection",
            "host",
            "content-length",
            "x-hop",
        ] {
            assert!(dst.get(name).is_none(), "{name} 应当被剥除");
        }
    }

    #[test]
    fn deny_set_includes_connection_tokens_and_extras() {
        let mut src = HeaderMap::new();
        src.append(header::CONNECTION, HeaderValue::from_static(" X-Hop , Foo "));
        let deny = build_pass_through_deny_set(&src, &["Sec-WebSocket-Key", "Content-Type"]);
        for name in ["x-hop", "foo", "sec-websocket-key", "content-type"] {
            assert!(deny.contains(name), "denyset 应包含 {name}");
        }
    }

    #[test]
    fn channel_test_skips_client_header_placeholder() {
        let mut templates = std::collections::HashMap::new();
        templates.insert(
            "X-Upstream-Trace".to_string(),
            "{client_header:X-Trace-Id}".to_string(),
        );
        let mut inbound = HeaderMap::new();
        inbound.insert("x-trace-id", HeaderValue::from_static("trace-123"));

        let resolved =
            resolve_header_overrides(&templates, &inbound, "sk-key", "req-1", true).unwrap();
        assert!(resolved.headers.is_empty());

        let resolved =
            resolve_header_overrides(&templates, &inbound, "sk-key", "req-1", false).unwrap();
        assert_eq!(resolved.headers.len(), 1);
        assert_eq!(resolved.headers[0].1, "trace-123");
    }

    #[test]
    fn wildcard_override_is_not_a_header() {
        let mut templates = std::collections::HashMap::new();
        templates.insert("*".to_string(), String::new());

        let resolved = resolve_header_overrides(
            &templates,
            &HeaderMap::new(),
            "sk-key",
            "req-1",
            true,
        )
        .unwrap();
        assert!(resolved.headers.is_empty());
        assert!(!resolved.suppress_client_headers);

        let resolved = resolve_header_overrides(
            &templates,
            &HeaderMap::new(),
            "sk-key",
            "req-1",
            false,
        )
        .unwrap();
        assert!(resolved.headers.is_empty());
        assert!(resolved.suppress_client_headers);
    }

    #[test]
    fn unknown_placeholder_is_config_error() {
        let mut templates = std::collections::HashMap::new();
        templates.insert("X-Custom".to_string(), "{mystery}".to_string());
        let result = resolve_header_overrides(
            &templates,
            &HeaderMap::new(),
            "sk-key",
            "req-1",
            false,
        );
        assert!(matches!(result, Err(RelayError::Config { .. })));
    }

    #[test]
    fn known_placeholders_resolve() {
        let mut templates = std::collections::HashMap::new();
        templates.insert("X-Key".to_string(), "Bearer {channel_key}".to_string());
        templates.insert("X-Req".to_string(), "{request_id}".to_string());
        let resolved = resolve_header_overrides(
            &templates,
            &HeaderMap::new(),
            "sk-upstream",
            "req-42",
            false,
        )
        .unwrap();
        let map: std::collections::HashMap<String, String> = resolved
            .headers
            .iter()
            .map(|(name, value)| {
                (name.to_string(), value.to_str().unwrap().to_string())
            })
            .collect();
        assert_eq!(map["x-key"], "Bearer sk-upstream");
        assert_eq!(map["x-req"], "req-42");
    }

    #[test]
    fn status_classification_follows_error_contract() {
        let headers = HeaderMap::new();
        let cooldown = Duration::from_secs(60);

        assert!(matches!(
            classify_upstream_status(http::StatusCode::UNAUTHORIZED, &headers, b"", cooldown),
            RelayError::ChannelFatal { .. }
        ));
        assert!(matches!(
            classify_upstream_status(http::StatusCode::NOT_FOUND, &headers, b"model not found", cooldown),
            RelayError::ChannelFatal { .. }
        ));
        assert!(matches!(
            classify_upstream_status(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                &headers,
                b"boom",
                cooldown
            ),
            RelayError::ChannelRetryable { cooldown: Some(_), .. }
        ));
        assert!(matches!(
            classify_upstream_status(
                http::StatusCode::BAD_REQUEST,
                &headers,
                br#"{"error":{"type":"insufficient_quota"}}"#,
                cooldown
            ),
            RelayError::ChannelFatal { .. }
        ));
        assert!(matches!(
            classify_upstream_status(http::StatusCode::BAD_REQUEST, &headers, b"bad", cooldown),
            RelayError::InvalidRequest { .. }
        ));
    }

    #[test]
    fn retry_after_header_drives_cooldown() {
        let mut headers = HeaderMap::new();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
        let err = classify_upstream_status(
            http::StatusCode::TOO_MANY_REQUESTS,
            &headers,
            b"slow down",
            Duration::from_secs(60),
        );
        match err {
            RelayError::ChannelRetryable { cooldown, .. } => {
                assert_eq!(cooldown, Some(Duration::from_secs(30)));
            }
            other => panic!("意外的错误类别: {other:?}"),
        }
    }
}
