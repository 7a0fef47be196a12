//! # OpenAI 家族编解码器
//!
//! chat.completions 线格式的双向转换，含 Azure 部署形状的变体。
//! 流式侧解码 `chat.completion.chunk` 并按 `tool_calls[*].index`
//! 归并工具调用增量。

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::{Map, Value, json};

use super::canonical::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, FinishReason, ROLE_ASSISTANT,
    ROLE_TOOL, Segment, StreamDelta, ToolSpec,
};
use super::sse::{SseEvent, format_event};
use super::{
    ApiDialect, BuildContext, ChannelFamily, ClientEmitter, DialectCodec, StreamDecoder,
    UpstreamRequestBody, UpstreamRequestParts,
};
use crate::error::{RelayError, Result};
use crate::relay::transport::build_upstream_url;
use crate::relay::usage::Usage;

/// Azure 部署 API 版本
const AZURE_API_VERSION: &str = "2024-06-01";

/// OpenAI 编解码器
pub struct OpenAiCodec;

/// Azure OpenAI 编解码器（同线格式，URL 与凭证注入不同）
pub struct AzureCodec;

impl DialectCodec for OpenAiCodec {
    fn family(&self) -> ChannelFamily {
        ChannelFamily::OpenAi
    }

    fn build_chat_request(
        &self,
        ctx: &BuildContext<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamRequestParts> {
        let path = match ctx.dialect {
            ApiDialect::Responses => ApiDialect::Responses.openai_path(),
            _ => ApiDialect::ChatCompletions.openai_path(),
        };
        let url = build_upstream_url(ctx.base_url, path, ChannelFamily::OpenAi)?;

        let body = if ctx.dialect == ApiDialect::Responses {
            super::responses::canonical_to_responses_body(ctx, request)
        } else {
            canonical_to_chat_body(ctx, request)
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            bearer_value(ctx.api_key)?,
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_str(ctx.request_id)
                .map_err(|e| RelayError::internal_with_source("请求ID非法", e))?,
        );

        Ok(UpstreamRequestParts {
            method: Method::POST,
            url,
            headers,
            body: UpstreamRequestBody::Json(body),
        })
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<CanonicalResponse> {
        parse_chat_response(body, model)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::default())
    }
}

impl DialectCodec for AzureCodec {
    fn family(&self) -> ChannelFamily {
        ChannelFamily::Azure
    }

    fn build_chat_request(
        &self,
        ctx: &BuildContext<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamRequestParts> {
        let base = ctx.base_url.trim_end_matches('/');
        let url = format!(
            "{base}/openai/deployments/{}/chat/completions?api-version={AZURE_API_VERSION}",
            ctx.upstream_model
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("api-key"),
            HeaderValue::from_str(ctx.api_key)
                .map_err(|e| RelayError::config(format!("渠道密钥无法作为头部值: {e}")))?,
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        Ok(UpstreamRequestParts {
            method: Method::POST,
            url,
            headers,
            body: UpstreamRequestBody::Json(canonical_to_chat_body(ctx, request)),
        })
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<CanonicalResponse> {
        parse_chat_response(body, model)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::default())
    }
}

pub(crate) fn bearer_value(key: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {key}"))
        .map_err(|e| RelayError::config(format!("渠道密钥无法作为头部值: {e}")))
}

// ---------------- 入站解析 ----------------

/// 解析 OpenAI chat/completions 请求体
pub fn parse_chat_request(body: &Value) -> Result<CanonicalRequest> {
    let object = body
        .as_object()
        .ok_or_else(|| RelayError::invalid_request("请求体必须是 JSON 对象"))?;
    let model = object
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::invalid_request("缺少 model 字段"))?;

    let mut request = CanonicalRequest::new(model);
    request.stream = object
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    request.max_output_tokens = object
        .get("max_completion_tokens")
        .or_else(|| object.get("max_tokens"))
        .and_then(Value::as_u64)
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX));
    request.temperature = object.get("temperature").and_then(Value::as_f64);
    request.top_p = object.get("top_p").and_then(Value::as_f64);
    request.stop = parse_stop(object.get("stop"));

    let messages = object
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::invalid_request("缺少 messages 字段"))?;
    if messages.is_empty() {
        return Err(RelayError::invalid_request("messages 不能为空"));
    }
    for message in messages {
        request.messages.push(parse_chat_message(message)?);
    }

    if let Some(tools) = object.get("tools").and_then(Value::as_array) {
        for tool in tools {
            let function = tool.get("function").unwrap_or(tool);
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RelayError::invalid_request("tool 缺少 name"))?;
            request.tools.push(ToolSpec {
                name: name.to_string(),
                description: function
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                parameters: function
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            });
        }
    }

    const KNOWN: &[&str] = &[
        "model",
        "messages",
        "stream",
        "max_tokens",
        "max_completion_tokens",
        "temperature",
        "top_p",
        "stop",
        "tools",
    ];
    for (key, value) in object {
        if !KNOWN.contains(&key.as_str()) {
            request.extra.insert(key.clone(), value.clone());
        }
    }
    Ok(request)
}

fn parse_stop(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(stop)) => vec![stop.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_chat_message(message: &Value) -> Result<CanonicalMessage> {
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::invalid_request("message 缺少 role"))?;
    let mut segments = Vec::new();

    match message.get("content") {
        Some(Value::String(text)) => {
            if !text.is_empty() {
                segments.push(Segment::Text(text.clone()));
            }
        }
        Some(Value::Array(parts)) => {
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            segments.push(Segment::Text(text.to_string()));
                        }
                    }
                    Some("image_url") => {
                        if let Some(url) = part
                            .get("image_url")
                            .and_then(|img| img.get("url"))
                            .and_then(Value::as_str)
                        {
                            segments.push(Segment::ImageUrl(url.to_string()));
                        }
                    }
                    _ => segments.push(Segment::OpaqueJson {
                        label: "openai_content_part".to_string(),
                        payload: part.clone(),
                    }),
                }
            }
        }
        _ => {}
    }

    if role == ROLE_TOOL {
        let content = segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>();
        return Ok(CanonicalMessage {
            role: ROLE_TOOL.to_string(),
            segments: vec![Segment::ToolResult {
                id: message
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: message
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                content,
            }],
        });
    }

    if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str) {
        if !reasoning.is_empty() {
            segments.insert(0, Segment::Reasoning(reasoning.to_string()));
        }
    }

    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let function = call.get("function").unwrap_or(call);
            segments.push(Segment::ToolCall {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
            });
        }
    }

    Ok(CanonicalMessage {
        role: role.to_string(),
        segments,
    })
}

// ---------------- 上游请求体 ----------------

/// 规范请求 -> chat/completions 请求体
pub fn canonical_to_chat_body(ctx: &BuildContext<'_>, request: &CanonicalRequest) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(ctx.upstream_model));

    let messages: Vec<Value> = request.messages.iter().map(message_to_json).collect();
    body.insert("messages".to_string(), Value::Array(messages));

    if let Some(max) = request.max_output_tokens {
        body.insert("max_tokens".to_string(), json!(max));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if !request.stop.is_empty() {
        body.insert("stop".to_string(), json!(request.stop));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if ctx.is_stream {
        body.insert("stream".to_string(), json!(true));
        // 让上游在末帧上报用量
        body.insert("stream_options".to_string(), json!({"include_usage": true}));
    }
    for (key, value) in &request.extra {
        body.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(body)
}

fn message_to_json(message: &CanonicalMessage) -> Value {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    let mut tool_result: Option<Value> = None;
    let mut parts: Vec<Value> = Vec::new();
    let mut has_image = false;

    for segment in &message.segments {
        match segment {
            Segment::Text(chunk) => {
                text.push_str(chunk);
                parts.push(json!({"type": "text", "text": chunk}));
            }
            Segment::Reasoning(chunk) => reasoning.push_str(chunk),
            Segment::ToolCall {
                id,
                name,
                arguments,
            } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            })),
            Segment::ToolResult { id, name, content } => {
                tool_result = Some(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "name": name,
                    "content": content,
                }));
            }
            Segment::ImageUrl(url) => {
                has_image = true;
                parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
            }
            Segment::OpaqueJson { payload, .. } => parts.push(payload.clone()),
        }
    }

    if let Some(result) = tool_result {
        return result;
    }

    let mut object = Map::new();
    object.insert("role".to_string(), json!(message.role));
    if has_image {
        object.insert("content".to_string(), Value::Array(parts));
    } else {
        object.insert("content".to_string(), json!(text));
    }
    if !reasoning.is_empty() {
        object.insert("reasoning_content".to_string(), json!(reasoning));
    }
    if !tool_calls.is_empty() {
        object.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Value::Object(object)
}

// ---------------- 响应解析 ----------------

fn parse_chat_response(body: &[u8], model: &str) -> Result<CanonicalResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::invalid_request(format!("上游响应不是合法 JSON: {e}")))?;

    let choice = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| RelayError::invalid_request("上游响应缺少 choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| RelayError::invalid_request("上游响应缺少 message"))?;

    let mut segments = Vec::new();
    if let Some(reasoning) = message.get("reasoning_content").and_then(Value::as_str) {
        if !reasoning.is_empty() {
            segments.push(Segment::Reasoning(reasoning.to_string()));
        }
    }
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }
    }
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let function = call.get("function").unwrap_or(call);
            segments.push(Segment::ToolCall {
                id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
            });
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::from_openai)
        .unwrap_or_default();

    Ok(CanonicalResponse {
        model: value
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        role: message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or(ROLE_ASSISTANT)
            .to_string(),
        segments,
        finish_reason,
        usage: parse_usage(value.get("usage")),
    })
}

/// OpenAI usage 对象 -> 规范用量
pub fn parse_usage(value: Option<&Value>) -> Option<Usage> {
    let usage = value?.as_object()?;
    let field = |key: &str| {
        usage
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    let mut result = Usage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
        ..Usage::default()
    };
    if let Some(details) = usage.get("prompt_tokens_details") {
        result.cached_tokens = details
            .get("cached_tokens")
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0);
    }
    if let Some(details) = usage.get("completion_tokens_details") {
        result.reasoning_tokens = details
            .get("reasoning_tokens")
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0);
    }
    if result.is_empty() {
        return None;
    }
    result.normalize();
    Some(result)
}

/// 规范用量 -> OpenAI usage 对象
#[must_use]
pub fn usage_to_json(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
        "prompt_tokens_details": {"cached_tokens": usage.cached_tokens},
        "completion_tokens_details": {"reasoning_tokens": usage.reasoning_tokens},
    })
}

/// 规范响应 -> chat.completion 响应体
#[must_use]
pub fn response_to_json(response: &CanonicalResponse, request_id: &str) -> Value {
    let mut message = Map::new();
    message.insert("role".to_string(), json!(response.role));
    message.insert("content".to_string(), json!(response.output_text()));
    let reasoning = response.reasoning_text();
    if !reasoning.is_empty() {
        message.insert("reasoning_content".to_string(), json!(reasoning));
    }
    let calls = response.tool_calls();
    if !calls.is_empty() {
        let calls: Vec<Value> = calls
            .iter()
            .map(|(id, name, arguments)| {
                json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                })
            })
            .collect();
        message.insert("tool_calls".to_string(), Value::Array(calls));
    }

    json!({
        "id": format!("chatcmpl-{request_id}"),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": response.finish_reason.as_openai(),
        }],
        "usage": response.usage.as_ref().map(usage_to_json),
    })
}

// ---------------- 流式解码 ----------------

/// chat.completion.chunk 流解码器
#[derive(Default)]
pub struct OpenAiStreamDecoder {
    saw_done: bool,
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamDelta>> {
        if self.saw_done {
            // [DONE] 之后的任何事件不参与聚合
            return Ok(vec![StreamDelta::Ignore]);
        }
        if event.is_done_sentinel() {
            self.saw_done = true;
            return Ok(vec![StreamDelta::Done]);
        }
        if event.data.trim().is_empty() {
            return Ok(vec![StreamDelta::Ignore]);
        }
        let value: Value = serde_json::from_str(event.data.trim())
            .map_err(|e| RelayError::invalid_request(format!("流事件不是合法 JSON: {e}")))?;

        let mut deltas = Vec::new();
        if let Some(choice) = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        {
            if let Some(delta) = choice.get("delta") {
                if let Some(role) = delta.get("role").and_then(Value::as_str) {
                    deltas.push(StreamDelta::Role(role.to_string()));
                }
                if let Some(content) = delta.get("content").and_then(Value::as_str) {
                    if !content.is_empty() {
                        deltas.push(StreamDelta::Content(content.to_string()));
                    }
                }
                if let Some(reasoning) =
                    delta.get("reasoning_content").and_then(Value::as_str)
                {
                    if !reasoning.is_empty() {
                        deltas.push(StreamDelta::Reasoning(reasoning.to_string()));
                    }
                }
                if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    for call in calls {
                        let index = call
                            .get("index")
                            .and_then(Value::as_u64)
                            .map(|v| u32::try_from(v).unwrap_or(0))
                            .unwrap_or(0);
                        let function = call.get("function").unwrap_or(call);
                        deltas.push(StreamDelta::ToolCall {
                            index,
                            id: call
                                .get("id")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            name: function
                                .get("name")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            args_fragment: function
                                .get("arguments")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            args_replace: None,
                        });
                    }
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                deltas.push(StreamDelta::Finish(FinishReason::from_openai(reason)));
            }
        }
        if let Some(usage) = parse_usage(value.get("usage")) {
            deltas.push(StreamDelta::Usage(usage));
        }
        if deltas.is_empty() {
            deltas.push(StreamDelta::Ignore);
        }
        Ok(deltas)
    }
}

// ---------------- 客户端发射 ----------------

/// chat.completion.chunk 客户端发射器
pub struct ChunkEmitter {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    sent_finish: bool,
    sent_done: bool,
    /// 每个工具调用已发出的参数长度（args_replace 只补尾差）
    sent_args_len: std::collections::HashMap<u32, usize>,
    announced_calls: std::collections::HashSet<u32>,
}

impl ChunkEmitter {
    #[must_use]
    pub fn new(model: &str, request_id: &str) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            sent_role: false,
            sent_finish: false,
            sent_done: false,
            sent_args_len: std::collections::HashMap::new(),
            announced_calls: std::collections::HashSet::new(),
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        format_event(None, &body.to_string())
    }

    fn role_preamble(&mut self, frames: &mut Vec<String>) {
        if !self.sent_role {
            self.sent_role = true;
            frames.push(self.chunk(json!({"role": ROLE_ASSISTANT, "content": ""}), None));
        }
    }

    fn tool_call_frame(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: &str,
    ) -> String {
        let mut call = Map::new();
        call.insert("index".to_string(), json!(index));
        if self.announced_calls.insert(index) {
            if let Some(id) = id {
                call.insert("id".to_string(), json!(id));
            }
            call.insert("type".to_string(), json!("function"));
            call.insert(
                "function".to_string(),
                json!({"name": name.unwrap_or_default(), "arguments": arguments}),
            );
        } else {
            call.insert("function".to_string(), json!({"arguments": arguments}));
        }
        self.chunk(json!({"tool_calls": [Value::Object(call)]}), None)
    }
}

impl ClientEmitter for ChunkEmitter {
    fn emit(&mut self, delta: &StreamDelta) -> Vec<String> {
        let mut frames = Vec::new();
        match delta {
            StreamDelta::Role(role) => {
                if !self.sent_role {
                    self.sent_role = true;
                    frames.push(self.chunk(json!({"role": role, "content": ""}), None));
                }
            }
            StreamDelta::Content(text) => {
                self.role_preamble(&mut frames);
                frames.push(self.chunk(json!({"content": text}), None));
            }
            StreamDelta::Reasoning(text) => {
                self.role_preamble(&mut frames);
                frames.push(self.chunk(json!({"reasoning_content": text}), None));
            }
            StreamDelta::ToolCall {
                index,
                id,
                name,
                args_fragment,
                args_replace,
            } => {
                self.role_preamble(&mut frames);
                if let Some(fragment) = args_fragment {
                    *self.sent_args_len.entry(*index).or_insert(0) += fragment.len();
                    frames.push(self.tool_call_frame(
                        *index,
                        id.as_deref(),
                        name.as_deref(),
                        fragment,
                    ));
                } else if let Some(replacement) = args_replace {
                    let sent = *self.sent_args_len.get(index).unwrap_or(&0);
                    if replacement.len() > sent {
                        let suffix = replacement
                            .get(sent..)
                            .unwrap_or(replacement.as_str())
                            .to_string();
                        self.sent_args_len.insert(*index, replacement.len());
                        frames.push(self.tool_call_frame(
                            *index,
                            id.as_deref(),
                            name.as_deref(),
                            &suffix,
                        ));
                    } else if !self.announced_calls.contains(index) {
                        frames.push(self.tool_call_frame(*index, id.as_deref(), name.as_deref(), ""));
                    }
                } else {
                    frames.push(self.tool_call_frame(*index, id.as_deref(), name.as_deref(), ""));
                }
            }
            StreamDelta::Finish(reason) => {
                if !self.sent_finish {
                    self.sent_finish = true;
                    frames.push(self.chunk(json!({}), Some(reason.as_openai())));
                }
            }
            StreamDelta::Usage(usage) => {
                let body = json!({
                    "id": self.id,
                    "object": "chat.completion.chunk",
                    "created": self.created,
                    "model": self.model,
                    "choices": [],
                    "usage": usage_to_json(usage),
                });
                frames.push(format_event(None, &body.to_string()));
            }
            StreamDelta::Done => {
                if !self.sent_done {
                    self.sent_done = true;
                    frames.push(format_event(None, "[DONE]"));
                }
            }
            StreamDelta::Ignore => {}
        }
        frames
    }

    fn finish(&mut self, response: &CanonicalResponse) -> Vec<String> {
        let mut frames = Vec::new();
        if !self.sent_finish {
            self.sent_finish = true;
            frames.push(self.chunk(json!({}), Some(response.finish_reason.as_openai())));
        }
        if !self.sent_done {
            self.sent_done = true;
            frames.push(format_event(None, "[DONE]"));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::codec::canonical::StreamAggregator;

    fn decode_all(decoder: &mut dyn StreamDecoder, events: &[&str]) -> Vec<StreamDelta> {
        let mut all = Vec::new();
        for data in events {
            all.extend(decoder.decode(&SseEvent::data_only(*data)).unwrap());
        }
        all
    }

    #[test]
    fn parse_chat_request_extracts_core_fields() {
        let body = json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "max_tokens": 128,
            "temperature": 0.5,
            "logit_bias": {"50256": -100},
        });
        let request = parse_chat_request(&body).unwrap();
        assert_eq!(request.model, "gpt-4o-mini");
        assert!(request.stream);
        assert_eq!(request.max_output_tokens, Some(128));
        assert_eq!(request.messages.len(), 1);
        assert!(request.extra.contains_key("logit_bias"));
    }

    #[test]
    fn parse_chat_request_rejects_missing_model() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert!(parse_chat_request(&body).is_err());
    }

    #[test]
    fn tool_message_becomes_tool_result_segment() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"},
            ],
        });
        let request = parse_chat_request(&body).unwrap();
        assert!(matches!(
            request.messages[2].segments[0],
            Segment::ToolResult { .. }
        ));
    }

    #[test]
    fn stream_aggregation_matches_s2_scenario() {
        let mut decoder = OpenAiStreamDecoder::default();
        let mut agg = StreamAggregator::new();
        let events = [
            r#"{"object":"chat.completion.chunk","choices":[{"index":0,"delta":{"role":"assistant","content":"A"}}]}"#,
            r#"{"object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"B"}}]}"#,
            r#"{"object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"C"},"finish_reason":"stop"}]}"#,
            r#"{"object":"chat.completion.chunk","choices":[],"usage":{"prompt_tokens":1,"completion_tokens":3,"total_tokens":4}}"#,
        ];
        for delta in decode_all(&mut decoder, &events) {
            agg.apply(&delta);
        }
        let response = agg.finish("gpt-4o-mini");
        assert_eq!(response.output_text(), "ABC");
        let usage = response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 1);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn tool_call_fragments_keep_index_merge() {
        let mut decoder = OpenAiStreamDecoder::default();
        let mut agg = StreamAggregator::new();
        let events = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]}}]}"#,
        ];
        for delta in decode_all(&mut decoder, &events) {
            agg.apply(&delta);
        }
        let response = agg.finish("gpt-4o");
        assert_eq!(
            response.tool_calls()[0],
            ("call_9", "lookup", "{\"q\":\"rust\"}")
        );
    }

    #[test]
    fn emitter_replays_canonical_stream() {
        let mut emitter = ChunkEmitter::new("gpt-4o-mini", "req-1");
        let mut frames = Vec::new();
        frames.extend(emitter.emit(&StreamDelta::Content("A".into())));
        frames.extend(emitter.emit(&StreamDelta::Content("B".into())));
        frames.extend(emitter.emit(&StreamDelta::Done));

        // 首帧补 role，其后逐字转发
        assert!(frames[0].contains("\"role\":\"assistant\""));
        assert!(frames[1].contains("\"content\":\"A\""));
        assert!(frames.last().unwrap().contains("[DONE]"));
    }

    #[test]
    fn emitter_args_replace_only_sends_suffix() {
        let mut emitter = ChunkEmitter::new("gpt-4o", "req-2");
        emitter.emit(&StreamDelta::ToolCall {
            index: 0,
            id: Some("call_1".into()),
            name: Some("f".into()),
            args_fragment: Some("{\"a\"".into()),
            args_replace: None,
        });
        let frames = emitter.emit(&StreamDelta::ToolCall {
            index: 0,
            id: None,
            name: None,
            args_fragment: None,
            args_replace: Some("{\"a\":1}".into()),
        });
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(":1}"));
        assert!(!frames[0].contains("{\\\"a\\\"{"));
    }

    #[test]
    fn buffered_response_round_trip() {
        let raw = json!({
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7},
        });
        let response =
            parse_chat_response(raw.to_string().as_bytes(), "gpt-4o-mini").unwrap();
        assert_eq!(response.output_text(), "hello");
        assert_eq!(response.usage.unwrap().total_tokens, 7);

        let rendered = response_to_json(&response, "req-3");
        assert_eq!(rendered["choices"][0]["message"]["content"], "hello");
        assert_eq!(rendered["usage"]["total_tokens"], 7);
    }
}
