//! # Claude 家族编解码器
//!
//! Anthropic messages 线格式。流式侧按 `index` 维护内容块表：
//! `content_block_start` 建块，`input_json_delta` 进入按块的
//! 局部 JSON 缓冲，`content_block_stop` 时整体解析并赋给块输入。

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

use super::canonical::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, FinishReason, ROLE_ASSISTANT,
    ROLE_SYSTEM, ROLE_TOOL, ROLE_USER, Segment, StreamDelta, ToolSpec,
};
use super::sse::{SseEvent, format_event};
use super::{
    BuildContext, ChannelFamily, ClientEmitter, DialectCodec, StreamDecoder, UpstreamRequestBody,
    UpstreamRequestParts,
};
use crate::error::{RelayError, Result};
use crate::relay::transport::build_upstream_url;
use crate::relay::usage::Usage;

/// Anthropic API 版本头
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Claude 编解码器
pub struct ClaudeCodec;

impl DialectCodec for ClaudeCodec {
    fn family(&self) -> ChannelFamily {
        ChannelFamily::Claude
    }

    fn build_chat_request(
        &self,
        ctx: &BuildContext<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamRequestParts> {
        let url = build_upstream_url(ctx.base_url, "/v1/messages", ChannelFamily::Claude)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(ctx.api_key)
                .map_err(|e| RelayError::config(format!("渠道密钥无法作为头部值: {e}")))?,
        );
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        Ok(UpstreamRequestParts {
            method: Method::POST,
            url,
            headers,
            body: UpstreamRequestBody::Json(canonical_to_messages_body(ctx, request)),
        })
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<CanonicalResponse> {
        parse_messages_response(body, model)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ClaudeStreamDecoder::default())
    }
}

// ---------------- 入站解析 ----------------

/// 解析 Anthropic messages 请求体
pub fn parse_messages_request(body: &Value) -> Result<CanonicalRequest> {
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
        .get("max_tokens")
        .and_then(Value::as_u64)
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX));
    request.temperature = object.get("temperature").and_then(Value::as_f64);
    request.top_p = object.get("top_p").and_then(Value::as_f64);
    if let Some(stops) = object.get("stop_sequences").and_then(Value::as_array) {
        request.stop = stops
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }

    match object.get("system") {
        Some(Value::String(system)) if !system.is_empty() => {
            request
                .messages
                .push(CanonicalMessage::text(ROLE_SYSTEM, system.clone()));
        }
        Some(Value::Array(blocks)) => {
            let text: String = blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                request
                    .messages
                    .push(CanonicalMessage::text(ROLE_SYSTEM, text));
            }
        }
        _ => {}
    }

    let messages = object
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::invalid_request("缺少 messages 字段"))?;
    if messages.is_empty() {
        return Err(RelayError::invalid_request("messages 不能为空"));
    }
    for message in messages {
        request.messages.push(parse_claude_message(message)?);
    }

    if let Some(tools) = object.get("tools").and_then(Value::as_array) {
        for tool in tools {
            let name = tool
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RelayError::invalid_request("tool 缺少 name"))?;
            request.tools.push(ToolSpec {
                name: name.to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                parameters: tool
                    .get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            });
        }
    }

    const KNOWN: &[&str] = &[
        "model",
        "messages",
        "system",
        "stream",
        "max_tokens",
        "temperature",
        "top_p",
        "stop_sequences",
        "tools",
    ];
    for (key, value) in object {
        if !KNOWN.contains(&key.as_str()) {
            request.extra.insert(key.clone(), value.clone());
        }
    }
    Ok(request)
}

fn parse_claude_message(message: &Value) -> Result<CanonicalMessage> {
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
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            segments.push(Segment::Text(text.to_string()));
                        }
                    }
                    Some("thinking") => {
                        if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                            segments.push(Segment::Reasoning(text.to_string()));
                        }
                    }
                    Some("tool_use") => segments.push(Segment::ToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block
                            .get("input")
                            .map(Value::to_string)
                            .unwrap_or_else(|| "{}".to_string()),
                    }),
                    Some("tool_result") => {
                        let content = match block.get("content") {
                            Some(Value::String(text)) => text.clone(),
                            Some(Value::Array(parts)) => parts
                                .iter()
                                .filter_map(|part| part.get("text").and_then(Value::as_str))
                                .collect(),
                            _ => String::new(),
                        };
                        segments.push(Segment::ToolResult {
                            id: block
                                .get("tool_use_id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            name: None,
                            content,
                        });
                    }
                    Some("image") => {
                        if let Some(source) = block.get("source") {
                            let url = source
                                .get("url")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                                .unwrap_or_else(|| {
                                    format!(
                                        "data:{};base64,{}",
                                        source
                                            .get("media_type")
                                            .and_then(Value::as_str)
                                            .unwrap_or("image/png"),
                                        source
                                            .get("data")
                                            .and_then(Value::as_str)
                                            .unwrap_or_default()
                                    )
                                });
                            segments.push(Segment::ImageUrl(url));
                        }
                    }
                    _ => segments.push(Segment::OpaqueJson {
                        label: "claude_content_block".to_string(),
                        payload: block.clone(),
                    }),
                }
            }
        }
        _ => {}
    }

    Ok(CanonicalMessage {
        role: role.to_string(),
        segments,
    })
}

// ---------------- 上游请求体 ----------------

/// 规范请求 -> Anthropic messages 请求体
pub fn canonical_to_messages_body(ctx: &BuildContext<'_>, request: &CanonicalRequest) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(ctx.upstream_model));

    // system 消息提取为顶层 system 字段
    let system: String = request
        .messages
        .iter()
        .filter(|message| message.role == ROLE_SYSTEM)
        .map(CanonicalMessage::joined_text)
        .collect::<Vec<_>>()
        .join("\n");
    if !system.is_empty() {
        body.insert("system".to_string(), json!(system));
    }

    let mut messages = Vec::new();
    for message in &request.messages {
        if message.role == ROLE_SYSTEM {
            continue;
        }
        messages.push(claude_message_to_json(message));
    }
    body.insert("messages".to_string(), Value::Array(messages));

    body.insert(
        "max_tokens".to_string(),
        json!(request
            .max_output_tokens
            .unwrap_or(ctx.max_output_tokens_default)),
    );
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if !request.stop.is_empty() {
        body.insert("stop_sequences".to_string(), json!(request.stop));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if ctx.is_stream {
        body.insert("stream".to_string(), json!(true));
    }
    for (key, value) in &request.extra {
        body.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(body)
}

fn claude_message_to_json(message: &CanonicalMessage) -> Value {
    // tool 角色消息在 Anthropic 线格式下是 user + tool_result 块
    let role = if message.role == ROLE_TOOL {
        ROLE_USER
    } else if message.role == ROLE_ASSISTANT {
        ROLE_ASSISTANT
    } else {
        ROLE_USER
    };

    let mut blocks = Vec::new();
    for segment in &message.segments {
        match segment {
            Segment::Text(text) => blocks.push(json!({"type": "text", "text": text})),
            Segment::Reasoning(text) => {
                blocks.push(json!({"type": "thinking", "thinking": text}));
            }
            Segment::ToolCall {
                id,
                name,
                arguments,
            } => {
                let input: Value =
                    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                blocks.push(json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": input,
                }));
            }
            Segment::ToolResult { id, content, .. } => blocks.push(json!({
                "type": "tool_result",
                "tool_use_id": id,
                "content": content,
            })),
            Segment::ImageUrl(url) => {
                let source = if let Some(rest) = url.strip_prefix("data:") {
                    let (media_type, data) = rest
                        .split_once(";base64,")
                        .unwrap_or(("image/png", rest));
                    json!({"type": "base64", "media_type": media_type, "data": data})
                } else {
                    json!({"type": "url", "url": url})
                };
                blocks.push(json!({"type": "image", "source": source}));
            }
            Segment::OpaqueJson { payload, .. } => blocks.push(payload.clone()),
        }
    }
    json!({"role": role, "content": blocks})
}

// ---------------- 响应解析 ----------------

fn parse_messages_response(body: &[u8], model: &str) -> Result<CanonicalResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::invalid_request(format!("上游响应不是合法 JSON: {e}")))?;

    let mut segments = Vec::new();
    if let Some(blocks) = value.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        segments.push(Segment::Text(text.to_string()));
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                        segments.push(Segment::Reasoning(text.to_string()));
                    }
                }
                Some("tool_use") => segments.push(Segment::ToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: block
                        .get("input")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                }),
                _ => {}
            }
        }
    }

    let finish_reason = value
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(FinishReason::from_claude)
        .unwrap_or_default();

    Ok(CanonicalResponse {
        model: value
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        role: value
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or(ROLE_ASSISTANT)
            .to_string(),
        segments,
        finish_reason,
        usage: parse_claude_usage(value.get("usage")),
    })
}

/// Anthropic usage 对象 -> 规范用量。
/// prompt 计入缓存读写 token，cached 单独记录供差别计价。
pub fn parse_claude_usage(value: Option<&Value>) -> Option<Usage> {
    let usage = value?.as_object()?;
    let field = |key: &str| {
        usage
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    let input = field("input_tokens");
    let output = field("output_tokens");
    let cache_read = field("cache_read_input_tokens");
    let cache_create = field("cache_creation_input_tokens");
    let mut result = Usage {
        prompt_tokens: input
            .saturating_add(cache_read)
            .saturating_add(cache_create),
        completion_tokens: output,
        cached_tokens: cache_read,
        ..Usage::default()
    };
    if result.is_empty() {
        return None;
    }
    result.normalize();
    Some(result)
}

/// 规范响应 -> Anthropic messages 响应体
#[must_use]
pub fn response_to_json(response: &CanonicalResponse, request_id: &str) -> Value {
    let mut content = Vec::new();
    let reasoning = response.reasoning_text();
    if !reasoning.is_empty() {
        content.push(json!({"type": "thinking", "thinking": reasoning}));
    }
    let text = response.output_text();
    if !text.is_empty() {
        content.push(json!({"type": "text", "text": text}));
    }
    for (id, name, arguments) in response.tool_calls() {
        let input: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }));
    }

    let usage = response.usage.unwrap_or_default();
    json!({
        "id": format!("msg_{request_id}"),
        "type": "message",
        "role": response.role,
        "model": response.model,
        "content": content,
        "stop_reason": response.finish_reason.as_claude(),
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
            "cache_read_input_tokens": usage.cached_tokens,
        },
    })
}

// ---------------- 流式解码 ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Anthropic 消息流解码器
#[derive(Default)]
pub struct ClaudeStreamDecoder {
    block_kinds: HashMap<u64, BlockKind>,
    /// 工具块的局部 JSON 缓冲，content_block_stop 时整体解析
    json_buffers: HashMap<u64, String>,
    /// Claude 块 index -> 工具调用序号
    tool_ordinals: HashMap<u64, u32>,
    next_tool_ordinal: u32,
    input_tokens: u32,
    cache_read_tokens: u32,
    cache_create_tokens: u32,
    output_tokens: u32,
}

impl ClaudeStreamDecoder {
    fn usage_snapshot(&self) -> Usage {
        let mut usage = Usage {
            prompt_tokens: self
                .input_tokens
                .saturating_add(self.cache_read_tokens)
                .saturating_add(self.cache_create_tokens),
            completion_tokens: self.output_tokens,
            cached_tokens: self.cache_read_tokens,
            ..Usage::default()
        };
        usage.normalize();
        usage
    }
}

impl StreamDecoder for ClaudeStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamDelta>> {
        if event.data.trim().is_empty() {
            return Ok(vec![StreamDelta::Ignore]);
        }
        let value: Value = serde_json::from_str(event.data.trim())
            .map_err(|e| RelayError::invalid_request(format!("流事件不是合法 JSON: {e}")))?;
        let event_type = event
            .event
            .as_deref()
            .or_else(|| value.get("type").and_then(Value::as_str))
            .unwrap_or_default();

        let mut deltas = Vec::new();
        match event_type {
            "message_start" => {
                if let Some(message) = value.get("message") {
                    if let Some(role) = message.get("role").and_then(Value::as_str) {
                        deltas.push(StreamDelta::Role(role.to_string()));
                    }
                    if let Some(usage) = message.get("usage").and_then(Value::as_object) {
                        let field = |key: &str| {
                            usage
                                .get(key)
                                .and_then(Value::as_u64)
                                .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
                                .unwrap_or(0)
                        };
                        self.input_tokens = field("input_tokens");
                        self.cache_read_tokens = field("cache_read_input_tokens");
                        self.cache_create_tokens = field("cache_creation_input_tokens");
                    }
                }
            }
            "content_block_start" => {
                let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = value.get("content_block") {
                    match block.get("type").and_then(Value::as_str) {
                        Some("tool_use") => {
                            self.block_kinds.insert(index, BlockKind::ToolUse);
                            self.json_buffers.insert(index, String::new());
                            let ordinal = self.next_tool_ordinal;
                            self.next_tool_ordinal += 1;
                            self.tool_ordinals.insert(index, ordinal);
                            deltas.push(StreamDelta::ToolCall {
                                index: ordinal,
                                id: block
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                name: block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                args_fragment: None,
                                args_replace: None,
                            });
                        }
                        Some("thinking") => {
                            self.block_kinds.insert(index, BlockKind::Thinking);
                        }
                        _ => {
                            self.block_kinds.insert(index, BlockKind::Text);
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                if !text.is_empty() {
                                    deltas.push(StreamDelta::Content(text.to_string()));
                                }
                            }
                        }
                    }
                }
            }
            "content_block_delta" => {
                let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(delta) = value.get("delta") {
                    match delta.get("type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                deltas.push(StreamDelta::Content(text.to_string()));
                            }
                        }
                        Some("thinking_delta") => {
                            if let Some(text) =
                                delta.get("thinking").and_then(Value::as_str)
                            {
                                deltas.push(StreamDelta::Reasoning(text.to_string()));
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(fragment) =
                                delta.get("partial_json").and_then(Value::as_str)
                            {
                                if let Some(buffer) = self.json_buffers.get_mut(&index) {
                                    buffer.push_str(fragment);
                                }
                                if let Some(ordinal) = self.tool_ordinals.get(&index) {
                                    deltas.push(StreamDelta::ToolCall {
                                        index: *ordinal,
                                        id: None,
                                        name: None,
                                        args_fragment: Some(fragment.to_string()),
                                        args_replace: None,
                                    });
                                }
                            }
                        }
                        _ => deltas.push(StreamDelta::Ignore),
                    }
                }
            }
            "content_block_stop" => {
                let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
                if self.block_kinds.get(&index) == Some(&BlockKind::ToolUse) {
                    if let (Some(buffer), Some(ordinal)) = (
                        self.json_buffers.remove(&index),
                        self.tool_ordinals.get(&index),
                    ) {
                        let replacement = if buffer.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            buffer
                        };
                        deltas.push(StreamDelta::ToolCall {
                            index: *ordinal,
                            id: None,
                            name: None,
                            args_fragment: None,
                            args_replace: Some(replacement),
                        });
                    }
                }
            }
            "message_delta" => {
                if let Some(delta) = value.get("delta") {
                    if let Some(reason) = delta.get("stop_reason").and_then(Value::as_str) {
                        deltas.push(StreamDelta::Finish(FinishReason::from_claude(reason)));
                    }
                }
                if let Some(usage) = value.get("usage").and_then(Value::as_object) {
                    if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                        self.output_tokens = u32::try_from(output).unwrap_or(u32::MAX);
                    }
                }
            }
            "message_stop" => {
                deltas.push(StreamDelta::Usage(self.usage_snapshot()));
                deltas.push(StreamDelta::Done);
            }
            // ping 与未知事件对聚合无意义
            _ => deltas.push(StreamDelta::Ignore),
        }
        if deltas.is_empty() {
            deltas.push(StreamDelta::Ignore);
        }
        Ok(deltas)
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>> {
        // 上游异常中断时用已见计数收口
        if self.output_tokens > 0 || self.input_tokens > 0 {
            Ok(vec![StreamDelta::Usage(self.usage_snapshot())])
        } else {
            Ok(Vec::new())
        }
    }
}

// ---------------- 客户端发射 ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmitBlock {
    None,
    Text,
    Thinking,
    Tool(u32),
}

/// Anthropic 事件流客户端发射器
pub struct EventEmitter {
    message_id: String,
    model: String,
    started: bool,
    current: EmitBlock,
    next_block_index: u64,
    finished: bool,
    sent_stop: bool,
    sent_args_len: HashMap<u32, usize>,
    output_tokens_hint: u32,
}

impl EventEmitter {
    #[must_use]
    pub fn new(model: &str, request_id: &str) -> Self {
        Self {
            message_id: format!("msg_{request_id}"),
            model: model.to_string(),
            started: false,
            current: EmitBlock::None,
            next_block_index: 0,
            finished: false,
            sent_stop: false,
            sent_args_len: HashMap::new(),
            output_tokens_hint: 0,
        }
    }

    fn frame(name: &str, body: Value) -> String {
        format_event(Some(name), &body.to_string())
    }

    fn start_message(&mut self, frames: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        frames.push(Self::frame(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": ROLE_ASSISTANT,
                    "model": self.model,
                    "content": [],
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        ));
    }

    fn close_block(&mut self, frames: &mut Vec<String>) {
        if self.current != EmitBlock::None {
            frames.push(Self::frame(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": self.next_block_index - 1}),
            ));
            self.current = EmitBlock::None;
        }
    }

    fn open_block(&mut self, kind: EmitBlock, start: Value, frames: &mut Vec<String>) {
        self.close_block(frames);
        frames.push(Self::frame(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.next_block_index,
                "content_block": start,
            }),
        ));
        self.next_block_index += 1;
        self.current = kind;
    }

    fn block_delta(&self, delta: Value) -> String {
        Self::frame(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.next_block_index - 1,
                "delta": delta,
            }),
        )
    }
}

impl ClientEmitter for EventEmitter {
    fn emit(&mut self, delta: &StreamDelta) -> Vec<String> {
        let mut frames = Vec::new();
        match delta {
            StreamDelta::Role(_) => self.start_message(&mut frames),
            StreamDelta::Content(text) => {
                self.start_message(&mut frames);
                if self.current != EmitBlock::Text {
                    self.open_block(
                        EmitBlock::Text,
                        json!({"type": "text", "text": ""}),
                        &mut frames,
                    );
                }
                frames.push(self.block_delta(json!({"type": "text_delta", "text": text})));
            }
            StreamDelta::Reasoning(text) => {
                self.start_message(&mut frames);
                if self.current != EmitBlock::Thinking {
                    self.open_block(
                        EmitBlock::Thinking,
                        json!({"type": "thinking", "thinking": ""}),
                        &mut frames,
                    );
                }
                frames
                    .push(self.block_delta(json!({"type": "thinking_delta", "thinking": text})));
            }
            StreamDelta::ToolCall {
                index,
                id,
                name,
                args_fragment,
                args_replace,
            } => {
                self.start_message(&mut frames);
                if self.current != EmitBlock::Tool(*index) {
                    self.open_block(
                        EmitBlock::Tool(*index),
                        json!({
                            "type": "tool_use",
                            "id": id.clone().unwrap_or_else(|| format!("toolu_{index}")),
                            "name": name.clone().unwrap_or_default(),
                            "input": {},
                        }),
                        &mut frames,
                    );
                }
                if let Some(fragment) = args_fragment {
                    *self.sent_args_len.entry(*index).or_insert(0) += fragment.len();
                    frames.push(self.block_delta(
                        json!({"type": "input_json_delta", "partial_json": fragment}),
                    ));
                } else if let Some(replacement) = args_replace {
                    let sent = *self.sent_args_len.get(index).unwrap_or(&0);
                    if replacement.len() > sent {
                        let suffix = replacement
                            .get(sent..)
                            .unwrap_or(replacement.as_str())
                            .to_string();
                        self.sent_args_len.insert(*index, replacement.len());
                        frames.push(self.block_delta(
                            json!({"type": "input_json_delta", "partial_json": suffix}),
                        ));
                    }
                }
            }
            StreamDelta::Finish(reason) => {
                self.close_block(&mut frames);
                if !self.finished {
                    self.finished = true;
                    frames.push(Self::frame(
                        "message_delta",
                        json!({
                            "type": "message_delta",
                            "delta": {"stop_reason": reason.as_claude()},
                            "usage": {"output_tokens": self.output_tokens_hint},
                        }),
                    ));
                }
            }
            StreamDelta::Usage(usage) => {
                self.output_tokens_hint = usage.completion_tokens;
            }
            StreamDelta::Done => {
                self.close_block(&mut frames);
                if !self.sent_stop {
                    self.sent_stop = true;
                    frames.push(Self::frame(
                        "message_stop",
                        json!({"type": "message_stop"}),
                    ));
                }
            }
            StreamDelta::Ignore => {}
        }
        frames
    }

    fn finish(&mut self, response: &CanonicalResponse) -> Vec<String> {
        let mut frames = Vec::new();
        self.start_message(&mut frames);
        self.close_block(&mut frames);
        if !self.finished && !self.sent_stop {
            self.finished = true;
            let usage = response.usage.unwrap_or_default();
            frames.push(Self::frame(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": response.finish_reason.as_claude()},
                    "usage": {"output_tokens": usage.completion_tokens},
                }),
            ));
        }
        if !self.sent_stop {
            self.sent_stop = true;
            frames.push(Self::frame(
                "message_stop",
                json!({"type": "message_stop"}),
            ));
        }
        frames
    }
}
