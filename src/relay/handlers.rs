//! # 入站端点处理器
//!
//! OpenAI 兼容超集的各端点：鉴权、按方言解析入站体、装配
//! `RelayInfo` 后交给控制器。

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::AuthContext;
use crate::error::RelayError;
use crate::relay::codec::{self, ApiDialect};
use crate::relay::context::{InboundPayload, RelayInfo};
use crate::relay::controller::{self, error_response};

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_chat_dialect(state, ApiDialect::ChatCompletions, headers, None, body).await
}

/// POST /v1/responses
pub async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_chat_dialect(state, ApiDialect::Responses, headers, None, body).await
}

/// POST /v1/messages（Anthropic 原生入站方言）
pub async fn claude_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_chat_dialect(state, ApiDialect::ClaudeMessages, headers, None, body).await
}

/// POST /v1beta/models/{model:action}（Gemini 原生入站方言）
pub async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let dialect = ApiDialect::GeminiGenerateContent;
    let Some((model, action)) = model_action.split_once(':') else {
        return error_response(
            &RelayError::invalid_request("路径缺少 :generateContent 动作"),
            dialect,
        );
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return error_response(
                &RelayError::invalid_request(format!("不支持的动作: {other}")),
                dialect,
            );
        }
    };

    let auth = match state
        .auth
        .authenticate(&headers, query.get("key").map(String::as_str), "gemini")
        .await
    {
        Ok(auth) => auth,
        Err(err) => return error_response(&err, dialect),
    };

    let json: Value = match serde_json::from_slice(&body) {
        Ok(json) => json,
        Err(err) => {
            return error_response(
                &RelayError::invalid_request(format!("请求体解析失败: {err}")),
                dialect,
            );
        }
    };
    let mut canonical = match codec::parse_inbound(dialect, model, &json) {
        Ok(canonical) => canonical,
        Err(err) => return error_response(&err, dialect),
    };
    canonical.stream = stream;

    let mut info = build_info(&state, dialect, model.to_string(), stream, auth, headers);
    info.request_capture.capture_bytes(&body);
    controller::relay(state, info, InboundPayload::Chat(canonical)).await
}

/// POST /v1/completions（legacy，JSON 透传）
pub async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json_dialect(state, ApiDialect::Completions, headers, body).await
}

/// POST /v1/embeddings
pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json_dialect(state, ApiDialect::Embeddings, headers, body).await
}

/// POST /v1/images/generations
pub async fn images_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json_dialect(state, ApiDialect::ImagesGenerations, headers, body).await
}

/// POST /v1/audio/speech
pub async fn audio_speech(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json_dialect(state, ApiDialect::AudioSpeech, headers, body).await
}

/// POST /v1/audio/transcriptions（multipart 透传）
pub async fn audio_transcriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_binary_dialect(state, ApiDialect::AudioTranscriptions, headers, body).await
}

/// POST /v1/audio/translations（multipart 透传）
pub async fn audio_translations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_binary_dialect(state, ApiDialect::AudioTranslations, headers, body).await
}

// ---------------- 共享装配 ----------------

async fn relay_chat_dialect(
    state: Arc<AppState>,
    dialect: ApiDialect,
    headers: HeaderMap,
    query_key: Option<&str>,
    body: Bytes,
) -> Response {
    let auth = match state
        .auth
        .authenticate(&headers, query_key, dialect.as_str())
        .await
    {
        Ok(auth) => auth,
        Err(err) => return error_response(&err, dialect),
    };

    let json: Value = match serde_json::from_slice(&body) {
        Ok(json) => json,
        Err(err) => {
            return error_response(
                &RelayError::invalid_request(format!("请求体解析失败: {err}")),
                dialect,
            );
        }
    };
    let canonical = match codec::parse_inbound(dialect, "", &json) {
        Ok(canonical) => canonical,
        Err(err) => return error_response(&err, dialect),
    };

    let model = canonical.model.clone();
    let stream = canonical.stream;
    let mut info = build_info(&state, dialect, model, stream, auth, headers);
    info.request_capture.capture_bytes(&body);
    controller::relay(state, info, InboundPayload::Chat(canonical)).await
}

async fn relay_json_dialect(
    state: Arc<AppState>,
    dialect: ApiDialect,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let auth = match state
        .auth
        .authenticate(&headers, None, dialect.as_str())
        .await
    {
        Ok(auth) => auth,
        Err(err) => return error_response(&err, dialect),
    };

    let json: Value = match serde_json::from_slice(&body) {
        Ok(json) => json,
        Err(err) => {
            return error_response(
                &RelayError::invalid_request(format!("请求体解析失败: {err}")),
                dialect,
            );
        }
    };
    let Some(model) = json.get("model").and_then(Value::as_str).map(str::to_string) else {
        return error_response(&RelayError::invalid_request("缺少 model 字段"), dialect);
    };

    let payload = InboundPayload::Json(json);
    let stream = payload.wants_stream();
    let mut info = build_info(&state, dialect, model, stream, auth, headers);
    info.request_capture.capture_bytes(&body);
    controller::relay(state, info, payload).await
}

async fn relay_binary_dialect(
    state: Arc<AppState>,
    dialect: ApiDialect,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let auth = match state
        .auth
        .authenticate(&headers, None, dialect.as_str())
        .await
    {
        Ok(auth) => auth,
        Err(err) => return error_response(&err, dialect),
    };

    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let Some(model) = extract_multipart_model(&body, &content_type) else {
        return error_response(
            &RelayError::invalid_request("multipart 表单缺少 model 字段"),
            dialect,
        );
    };

    let mut info = build_info(&state, dialect, model, false, auth, headers);
    // 二进制载荷进捕获层做启发式（通常落为占位说明）
    info.request_capture.capture_bytes(&body);
    controller::relay(
        state,
        info,
        InboundPayload::Binary {
            bytes: body,
            content_type,
        },
    )
    .await
}

fn build_info(
    state: &Arc<AppState>,
    dialect: ApiDialect,
    model: String,
    stream: bool,
    auth: AuthContext,
    headers: HeaderMap,
) -> RelayInfo {
    let client_ip = client_ip_from_headers(&headers);
    RelayInfo::new(
        dialect,
        model,
        stream,
        auth,
        headers,
        client_ip,
        state.config.relay.request_timeout(stream),
    )
}

/// 反向代理常见头里取客户端 IP
fn client_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .filter(|value| !value.is_empty())
}

/// 从 multipart 表单里扫出 model 字段值（只读路由，不改写表单）
fn extract_multipart_model(body: &[u8], content_type: &str) -> Option<String> {
    if !content_type.starts_with("multipart/form-data") {
        return None;
    }
    let text = String::from_utf8_lossy(body);
    let marker = "name=\"model\"";
    let position = text.find(marker)?;
    let rest = &text[position + marker.len()..];
    // 字段头与值之间隔一个空行
    let value_start = rest.find("\r\n\r\n").map(|i| i + 4).or_else(|| {
        rest.find("\n\n").map(|i| i + 2)
    })?;
    let value = &rest[value_start..];
    let value_end = value.find('\r').or_else(|| value.find('\n'))?;
    let model = value[..value_end].trim();
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_model_extraction() {
        let body = b"--boundary\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n--boundary\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.mp3\"\r\n\r\n\xff\xfb\x90\r\n--boundary--\r\n";
        assert_eq!(
            extract_multipart_model(body, "multipart/form-data; boundary=boundary"),
            Some("whisper-1".to_string())
        );
        assert!(extract_multipart_model(body, "application/json").is_none());
        assert!(extract_multipart_model(b"no model here", "multipart/form-data").is_none());
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            http::HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert("x-real-ip", http::HeaderValue::from_static("192.0.2.1"));
        assert_eq!(
            client_ip_from_headers(&headers).as_deref(),
            Some("203.0.113.9")
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", http::HeaderValue::from_static("192.0.2.1"));
        assert_eq!(client_ip_from_headers(&headers).as_deref(), Some("192.0.2.1"));
        assert!(client_ip_from_headers(&HeaderMap::new()).is_none());
    }
}
