//! # Responses API 编解码器
//!
//! 事件化流：文本按 (output_index, content_index) 路由，函数调用
//! 参数按 item_id（优先）或 output_index 归桶，输出项表最终用
//! 「更长者胜」规则回填参数。

use serde_json::{Map, Value, json};
use std::collections::HashMap;

use super::canonical::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, FinishReason, ROLE_ASSISTANT,
    ROLE_SYSTEM, Segment, StreamDelta, ToolSpec,
};
use super::sse::{SseEvent, format_event};
use super::{BuildContext, StreamDecoder};
use crate::error::{RelayError, Result};
use crate::relay::usage::Usage;

// ---------------- 入站解析 ----------------

/// 解析 Responses API 请求体
pub fn parse_responses_request(body: &Value) -> Result<CanonicalRequest> {
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
        .get("max_output_tokens")
        .and_then(Value::as_u64)
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX));
    request.temperature = object.get("temperature").and_then(Value::as_f64);
    request.top_p = object.get("top_p").and_then(Value::as_f64);

    if let Some(instructions) = object.get("instructions").and_then(Value::as_str) {
        if !instructions.is_empty() {
            request
                .messages
                .push(CanonicalMessage::text(ROLE_SYSTEM, instructions));
        }
    }

    match object.get("input") {
        Some(Value::String(text)) => {
            request.messages.push(CanonicalMessage::text("user", text));
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(message) = parse_input_item(item) {
                    request.messages.push(message);
                }
            }
        }
        _ => return Err(RelayError::invalid_request("缺少 input 字段")),
    }
    if request.messages.is_empty() {
        return Err(RelayError::invalid_request("input 不能为空"));
    }

    if let Some(tools) = object.get("tools").and_then(Value::as_array) {
        for tool in tools {
            let Some(name) = tool.get("name").and_then(Value::as_str) else {
                continue;
            };
            request.tools.push(ToolSpec {
                name: name.to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                parameters: tool
                    .get("parameters")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            });
        }
    }

    const KNOWN: &[&str] = &[
        "model",
        "input",
        "instructions",
        "stream",
        "max_output_tokens",
        "temperature",
        "top_p",
        "tools",
    ];
    for (key, value) in object {
        if !KNOWN.contains(&key.as_str()) {
            request.extra.insert(key.clone(), value.clone());
        }
    }
    Ok(request)
}

fn parse_input_item(item: &Value) -> Option<CanonicalMessage> {
    match item.get("type").and_then(Value::as_str) {
        Some("message") | None => {
            let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
            let mut segments = Vec::new();
            match item.get("content") {
                Some(Value::String(text)) => segments.push(Segment::Text(text.clone())),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            segments.push(Segment::Text(text.to_string()));
                        }
                    }
                }
                _ => {}
            }
            Some(CanonicalMessage {
                role: role.to_string(),
                segments,
            })
        }
        Some("function_call") => Some(CanonicalMessage {
            role: ROLE_ASSISTANT.to_string(),
            segments: vec![Segment::ToolCall {
                id: item
                    .get("call_id")
                    .or_else(|| item.get("id"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                arguments: item
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}")
                    .to_string(),
            }],
        }),
        Some("function_call_output") => Some(CanonicalMessage {
            role: "tool".to_string(),
            segments: vec![Segment::ToolResult {
                id: item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                name: None,
                content: item
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }],
        }),
        _ => None,
    }
}

// ---------------- 上游请求体 ----------------

/// 规范请求 -> Responses API 请求体（OpenAI 家族渠道用）
#[must_use]
pub fn canonical_to_responses_body(ctx: &BuildContext<'_>, request: &CanonicalRequest) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(ctx.upstream_model));

    let instructions: String = request
        .messages
        .iter()
        .filter(|message| message.role == ROLE_SYSTEM)
        .map(CanonicalMessage::joined_text)
        .collect::<Vec<_>>()
        .join("\n");
    if !instructions.is_empty() {
        body.insert("instructions".to_string(), json!(instructions));
    }

    let mut input = Vec::new();
    for message in &request.messages {
        if message.role == ROLE_SYSTEM {
            continue;
        }
        for segment in &message.segments {
            match segment {
                Segment::ToolCall {
                    id,
                    name,
                    arguments,
                } => input.push(json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": arguments,
                })),
                Segment::ToolResult { id, content, .. } => input.push(json!({
                    "type": "function_call_output",
                    "call_id": id,
                    "output": content,
                })),
                _ => {}
            }
        }
        let text = message.joined_text();
        if !text.is_empty() {
            input.push(json!({"type": "message", "role": message.role, "content": text}));
        }
    }
    body.insert("input".to_string(), Value::Array(input));

    if let Some(max) = request.max_output_tokens {
        body.insert("max_output_tokens".to_string(), json!(max));
    }
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
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

// ---------------- 响应解析 ----------------

/// 解析缓冲的 Responses API 响应体
pub fn parse_responses_response(body: &[u8], model: &str) -> Result<CanonicalResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::invalid_request(format!("上游响应不是合法 JSON: {e}")))?;

    let mut segments = Vec::new();
    if let Some(output) = value.get("output").and_then(Value::as_array) {
        for item in output {
            match item.get("type").and_then(Value::as_str) {
                Some("message") => {
                    if let Some(parts) = item.get("content").and_then(Value::as_array) {
                        for part in parts {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                segments.push(Segment::Text(text.to_string()));
                            }
                        }
                    }
                }
                Some("function_call") => segments.push(Segment::ToolCall {
                    id: item
                        .get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: item
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: item
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}")
                        .to_string(),
                }),
                Some("reasoning") => {
                    if let Some(parts) = item.get("summary").and_then(Value::as_array) {
                        for part in parts {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                segments.push(Segment::Reasoning(text.to_string()));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let has_tool_calls = segments
        .iter()
        .any(|segment| matches!(segment, Segment::ToolCall { .. }));
    let finish_reason = match value.get("status").and_then(Value::as_str) {
        Some("incomplete") => FinishReason::Length,
        _ if has_tool_calls => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    };

    Ok(CanonicalResponse {
        model: value
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        role: ROLE_ASSISTANT.to_string(),
        segments,
        finish_reason,
        usage: parse_responses_usage(value.get("usage")),
    })
}

/// Responses usage 对象 -> 规范用量
pub fn parse_responses_usage(value: Option<&Value>) -> Option<Usage> {
    let usage = value?.as_object()?;
    let field = |key: &str| {
        usage
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    let mut result = Usage {
        prompt_tokens: field("input_tokens"),
        completion_tokens: field("output_tokens"),
        total_tokens: field("total_tokens"),
        ..Usage::default()
    };
    if let Some(details) = usage.get("input_tokens_details") {
        result.cached_tokens = details
            .get("cached_tokens")
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0);
    }
    if let Some(details) = usage.get("output_tokens_details") {
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

/// 规范响应 -> Responses API 响应体
#[must_use]
pub fn response_to_json(response: &CanonicalResponse, request_id: &str) -> Value {
    let mut output = Vec::new();
    let reasoning = response.reasoning_text();
    if !reasoning.is_empty() {
        output.push(json!({
            "type": "reasoning",
            "id": format!("rs_{request_id}"),
            "summary": [{"type": "summary_text", "text": reasoning}],
        }));
    }
    let text = response.output_text();
    if !text.is_empty() {
        output.push(json!({
            "type": "message",
            "id": format!("msg_{request_id}"),
            "role": response.role,
            "status": "completed",
            "content": [{"type": "output_text", "text": text, "annotations": []}],
        }));
    }
    for (ordinal, (id, name, arguments)) in response.tool_calls().iter().enumerate() {
        output.push(json!({
            "type": "function_call",
            "id": format!("fc_{request_id}_{ordinal}"),
            "call_id": id,
            "name": name,
            "arguments": arguments,
            "status": "completed",
        }));
    }

    let usage = response.usage.unwrap_or_default();
    json!({
        "id": format!("resp_{request_id}"),
        "object": "response",
        "created_at": chrono::Utc::now().timestamp(),
        "status": if response.finish_reason == FinishReason::Length {
            "incomplete"
        } else {
            "completed"
        },
        "model": response.model,
        "output": output,
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
            "input_tokens_details": {"cached_tokens": usage.cached_tokens},
            "output_tokens_details": {"reasoning_tokens": usage.reasoning_tokens},
        },
    })
}

// ---------------- 流式解码 ----------------

/// 事件化 Responses 流解码器
#[derive(Default)]
pub struct ResponsesStreamDecoder {
    /// (output_index, content_index) -> 已累计文本字节数
    text_lens: HashMap<(u64, u64), usize>,
    /// item_id -> 工具调用序号
    ordinals_by_item: HashMap<String, u32>,
    /// output_index -> 工具调用序号（item_id 缺失时的后备键）
    ordinals_by_output: HashMap<u64, u32>,
    next_tool_ordinal: u32,
}

impl ResponsesStreamDecoder {
    fn ordinal_for(&mut self, item_id: Option<&str>, output_index: Option<u64>) -> u32 {
        if let Some(item_id) = item_id {
            if let Some(ordinal) = self.ordinals_by_item.get(item_id) {
                return *ordinal;
            }
        }
        if let Some(output_index) = output_index {
            if let Some(ordinal) = self.ordinals_by_output.get(&output_index) {
                return *ordinal;
            }
        }
        let ordinal = self.next_tool_ordinal;
        self.next_tool_ordinal += 1;
        if let Some(item_id) = item_id {
            self.ordinals_by_item.insert(item_id.to_string(), ordinal);
        }
        if let Some(output_index) = output_index {
            self.ordinals_by_output.insert(output_index, ordinal);
        }
        ordinal
    }
}

impl StreamDecoder for ResponsesStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamDelta>> {
        if event.data.trim().is_empty() || event.is_done_sentinel() {
            return Ok(vec![StreamDelta::Ignore]);
        }
        let value: Value = serde_json::from_str(event.data.trim())
            .map_err(|e| RelayError::invalid_request(format!("流事件不是合法 JSON: {e}")))?;
        let event_type = event
            .event
            .as_deref()
            .or_else(|| value.get("type").and_then(Value::as_str))
            .unwrap_or_default();

        let output_index = value.get("output_index").and_then(Value::as_u64);
        let content_index = value.get("content_index").and_then(Value::as_u64);
        let item_id = value.get("item_id").and_then(Value::as_str);

        let mut deltas = Vec::new();
        match event_type {
            "response.output_text.delta" => {
                if let Some(text) = value.get("delta").and_then(Value::as_str) {
                    let key = (output_index.unwrap_or(0), content_index.unwrap_or(0));
                    *self.text_lens.entry(key).or_insert(0) += text.len();
                    deltas.push(StreamDelta::Content(text.to_string()));
                }
            }
            "response.output_text.done" => {
                // done 带全文；仅当比累计更长时补尾差
                if let Some(text) = value.get("text").and_then(Value::as_str) {
                    let key = (output_index.unwrap_or(0), content_index.unwrap_or(0));
                    let seen = self.text_lens.get(&key).copied().unwrap_or(0);
                    if text.len() > seen {
                        let suffix = text.get(seen..).unwrap_or(text).to_string();
                        self.text_lens.insert(key, text.len());
                        deltas.push(StreamDelta::Content(suffix));
                    }
                }
            }
            "response.reasoning_summary_text.delta" => {
                if let Some(text) = value.get("delta").and_then(Value::as_str) {
                    deltas.push(StreamDelta::Reasoning(text.to_string()));
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(fragment) = value.get("delta").and_then(Value::as_str) {
                    let ordinal = self.ordinal_for(item_id, output_index);
                    deltas.push(StreamDelta::ToolCall {
                        index: ordinal,
                        id: None,
                        name: None,
                        args_fragment: Some(fragment.to_string()),
                        args_replace: None,
                    });
                }
            }
            "response.function_call_arguments.done" => {
                if let Some(arguments) = value.get("arguments").and_then(Value::as_str) {
                    let ordinal = self.ordinal_for(item_id, output_index);
                    deltas.push(StreamDelta::ToolCall {
                        index: ordinal,
                        id: None,
                        name: None,
                        args_fragment: None,
                        args_replace: Some(arguments.to_string()),
                    });
                }
            }
            "response.output_item.added" | "response.output_item.done" => {
                if let Some(item) = value.get("item") {
                    if item.get("type").and_then(Value::as_str) == Some("function_call") {
                        let registered_id = item
                            .get("id")
                            .or_else(|| item.get("item_id"))
                            .and_then(Value::as_str);
                        let ordinal = self.ordinal_for(registered_id, output_index);
                        deltas.push(StreamDelta::ToolCall {
                            index: ordinal,
                            id: item
                                .get("call_id")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            name: item
                                .get("name")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            // 输出项自带的参数与累计缓冲取更长者
                            args_replace: item
                                .get("arguments")
                                .and_then(Value::as_str)
                                .filter(|s| !s.is_empty())
                                .map(str::to_string),
                            args_fragment: None,
                        });
                    }
                }
            }
            "response.created" => {
                deltas.push(StreamDelta::Role(ROLE_ASSISTANT.to_string()));
            }
            "response.completed" | "response.incomplete" => {
                if let Some(response) = value.get("response") {
                    if let Some(usage) = parse_responses_usage(response.get("usage")) {
                        deltas.push(StreamDelta::Usage(usage));
                    }
                }
                if event_type == "response.incomplete" {
                    deltas.push(StreamDelta::Finish(FinishReason::Length));
                }
                deltas.push(StreamDelta::Done);
            }
            _ => deltas.push(StreamDelta::Ignore),
        }
        if deltas.is_empty() {
            deltas.push(StreamDelta::Ignore);
        }
        Ok(deltas)
    }
}

// ---------------- 客户端发射 ----------------

/// Responses 事件流客户端发射器
pub struct EventEmitter {
    response_id: String,
    model: String,
    created: bool,
    message_opened: bool,
    sequence: u64,
    announced_calls: HashMap<u32, String>,
    completed: bool,
}

impl EventEmitter {
    #[must_use]
    pub fn new(model: &str, request_id: &str) -> Self {
        Self {
            response_id: format!("resp_{request_id}"),
            model: model.to_string(),
            created: false,
            message_opened: false,
            sequence: 0,
            announced_calls: HashMap::new(),
            completed: false,
        }
    }

    fn frame(&mut self, event_type: &str, mut body: Map<String, Value>) -> String {
        body.insert("type".to_string(), json!(event_type));
        body.insert("sequence_number".to_string(), json!(self.sequence));
        self.sequence += 1;
        format_event(Some(event_type), &Value::Object(body).to_string())
    }

    fn ensure_created(&mut self, frames: &mut Vec<String>) {
        if self.created {
            return;
        }
        self.created = true;
        let mut body = Map::new();
        body.insert(
            "response".to_string(),
            json!({
                "id": self.response_id,
                "object": "response",
                "model": self.model,
                "status": "in_progress",
                "output": [],
            }),
        );
        frames.push(self.frame("response.created", body));
    }

    fn ensure_message_open(&mut self, frames: &mut Vec<String>) {
        self.ensure_created(frames);
        if self.message_opened {
            return;
        }
        self.message_opened = true;
        let mut body = Map::new();
        body.insert("output_index".to_string(), json!(0));
        body.insert(
            "item".to_string(),
            json!({
                "type": "message",
                "id": format!("msg_{}", self.response_id),
                "role": ROLE_ASSISTANT,
                "status": "in_progress",
            }),
        );
        frames.push(self.frame("response.output_item.added", body));
    }
}

impl super::ClientEmitter for EventEmitter {
    fn emit(&mut self, delta: &StreamDelta) -> Vec<String> {
        let mut frames = Vec::new();
        match delta {
            StreamDelta::Role(_) => self.ensure_created(&mut frames),
            StreamDelta::Content(text) => {
                self.ensure_message_open(&mut frames);
                let mut body = Map::new();
                body.insert("output_index".to_string(), json!(0));
                body.insert("content_index".to_string(), json!(0));
                body.insert("delta".to_string(), json!(text));
                frames.push(self.frame("response.output_text.delta", body));
            }
            StreamDelta::Reasoning(text) => {
                self.ensure_created(&mut frames);
                let mut body = Map::new();
                body.insert("delta".to_string(), json!(text));
                frames.push(self.frame("response.reasoning_summary_text.delta", body));
            }
            StreamDelta::ToolCall {
                index,
                id,
                name,
                args_fragment,
                args_replace,
            } => {
                self.ensure_created(&mut frames);
                let item_id = format!("fc_{}_{index}", self.response_id);
                if !self.announced_calls.contains_key(index) {
                    self.announced_calls.insert(*index, String::new());
                    let mut body = Map::new();
                    body.insert("output_index".to_string(), json!(index + 1));
                    body.insert(
                        "item".to_string(),
                        json!({
                            "type": "function_call",
                            "id": item_id.as_str(),
                            "call_id": id.clone().unwrap_or_else(|| format!("call_{index}")),
                            "name": name.clone().unwrap_or_default(),
                            "arguments": "",
                        }),
                    );
                    frames.push(self.frame("response.output_item.added", body));
                }
                if let Some(fragment) = args_fragment {
                    if let Some(sent) = self.announced_calls.get_mut(index) {
                        sent.push_str(fragment);
                    }
                    let mut body = Map::new();
                    body.insert("item_id".to_string(), json!(item_id.as_str()));
                    body.insert("output_index".to_string(), json!(index + 1));
                    body.insert("delta".to_string(), json!(fragment));
                    frames.push(self.frame("response.function_call_arguments.delta", body));
                } else if let Some(replacement) = args_replace {
                    let sent_len = self
                        .announced_calls
                        .get(index)
                        .map(String::len)
                        .unwrap_or(0);
                    if replacement.len() > sent_len {
                        let suffix = replacement
                            .get(sent_len..)
                            .unwrap_or(replacement.as_str())
                            .to_string();
                        if let Some(sent) = self.announced_calls.get_mut(index) {
                            sent.push_str(&suffix);
                        }
                        let mut body = Map::new();
                        body.insert("item_id".to_string(), json!(item_id.as_str()));
                        body.insert("output_index".to_string(), json!(index + 1));
                        body.insert("delta".to_string(), json!(suffix));
                        frames
                            .push(self.frame("response.function_call_arguments.delta", body));
                    }
                }
            }
            StreamDelta::Finish(_) | StreamDelta::Usage(_) | StreamDelta::Done => {
                // 统一在 finish 收口，保持 completed 事件带终态 usage
            }
            StreamDelta::Ignore => {}
        }
        frames
    }

    fn finish(&mut self, response: &CanonicalResponse) -> Vec<String> {
        let mut frames = Vec::new();
        if self.completed {
            return frames;
        }
        self.completed = true;
        self.ensure_created(&mut frames);

        for (index, sent) in std::mem::take(&mut self.announced_calls) {
            let mut body = Map::new();
            body.insert(
                "item_id".to_string(),
                json!(format!("fc_{}_{index}", self.response_id)),
            );
            body.insert("arguments".to_string(), json!(sent));
            frames.push(self.frame("response.function_call_arguments.done", body));
        }

        if self.message_opened {
            let mut body = Map::new();
            body.insert("output_index".to_string(), json!(0));
            body.insert("content_index".to_string(), json!(0));
            body.insert("text".to_string(), json!(response.output_text()));
            frames.push(self.frame("response.output_text.done", body));
        }

        let mut body = Map::new();
        body.insert(
            "response".to_string(),
            response_to_json(
                response,
                self.response_id.trim_start_matches("resp_"),
            ),
        );
        let event_type = if response.finish_reason == FinishReason::Length {
            "response.incomplete"
        } else {
            "response.completed"
        };
        frames.push(self.frame(event_type, body));
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::codec::canonical::StreamAggregator;

    fn typed(event_type: &str, mut body: Value) -> SseEvent {
        body.as_object_mut()
            .unwrap()
            .insert("type".to_string(), json!(event_type));
        SseEvent {
            event: Some(event_type.to_string()),
            data: body.to_string(),
        }
    }

    #[test]
    fn responses_request_parses_string_input() {
        let body = json!({"model": "gpt-4o", "input": "hello", "instructions": "be kind"});
        let request = parse_responses_request(&body).unwrap();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, ROLE_SYSTEM);
    }

    #[test]
    fn text_routes_by_output_and_content_index() {
        let mut decoder = ResponsesStreamDecoder::default();
        let mut agg = StreamAggregator::new();
        let events = vec![
            typed("response.created", json!({"response": {}})),
            typed(
                "response.output_text.delta",
                json!({"output_index": 0, "content_index": 0, "delta": "Hel"}),
            ),
            typed(
                "response.output_text.delta",
                json!({"output_index": 0, "content_index": 0, "delta": "lo"}),
            ),
            typed(
                "response.output_text.done",
                json!({"output_index": 0, "content_index": 0, "text": "Hello!"}),
            ),
            typed(
                "response.completed",
                json!({"response": {"usage": {"input_tokens": 2, "output_tokens": 3, "total_tokens": 5}}}),
            ),
        ];
        for event in &events {
            for delta in decoder.decode(event).unwrap() {
                agg.apply(&delta);
            }
        }
        let response = agg.finish("gpt-4o");
        // done 全文比增量长，补了尾差
        assert_eq!(response.output_text(), "Hello!");
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn function_args_prefer_item_id_bucket() {
        let mut decoder = ResponsesStreamDecoder::default();
        let mut agg = StreamAggregator::new();
        let events = vec![
            typed(
                "response.output_item.added",
                json!({"output_index": 1, "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "lookup", "arguments": ""}}),
            ),
            typed(
                "response.function_call_arguments.delta",
                json!({"item_id": "fc_1", "output_index": 1, "delta": "{\"q\":"}),
            ),
            typed(
                "response.function_call_arguments.delta",
                json!({"item_id": "fc_1", "output_index": 1, "delta": "\"rust\"}"}),
            ),
            typed(
                "response.function_call_arguments.done",
                json!({"item_id": "fc_1", "output_index": 1, "arguments": "{\"q\":\"rust\"}"}),
            ),
        ];
        for event in &events {
            for delta in decoder.decode(event).unwrap() {
                agg.apply(&delta);
            }
        }
        let response = agg.finish("gpt-4o");
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "lookup");
        assert_eq!(calls[0].2, "{\"q\":\"rust\"}");
    }

    #[test]
    fn output_item_done_patches_longer_arguments() {
        let mut decoder = ResponsesStreamDecoder::default();
        let mut agg = StreamAggregator::new();
        let events = vec![
            typed(
                "response.output_item.added",
                json!({"output_index": 0, "item": {"type": "function_call", "id": "fc_9", "call_id": "call_9", "name": "f", "arguments": ""}}),
            ),
            typed(
                "response.function_call_arguments.delta",
                json!({"item_id": "fc_9", "delta": "{\"a\""}),
            ),
            // 输出项收尾带完整参数
            typed(
                "response.output_item.done",
                json!({"output_index": 0, "item": {"type": "function_call", "id": "fc_9", "call_id": "call_9", "name": "f", "arguments": "{\"a\":1}"}}),
            ),
        ];
        for event in &events {
            for delta in decoder.decode(event).unwrap() {
                agg.apply(&delta);
            }
        }
        let response = agg.finish("gpt-4o");
        assert_eq!(response.tool_calls()[0].2, "{\"a\":1}");
    }

    #[test]
    fn buffered_response_parses_output_items() {
        let raw = json!({
            "id": "resp_abc",
            "model": "gpt-4o",
            "status": "completed",
            "output": [
                {"type": "message", "role": "assistant",
                 "content": [{"type": "output_text", "text": "hello"}]},
                {"type": "function_call", "call_id": "call_1", "name": "f", "arguments": "{}"},
            ],
            "usage": {"input_tokens": 1, "output_tokens": 2, "total_tokens": 3},
        });
        let response =
            parse_responses_response(raw.to_string().as_bytes(), "gpt-4o").unwrap();
        assert_eq!(response.output_text(), "hello");
        assert_eq!(response.tool_calls().len(), 1);
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    }
}
