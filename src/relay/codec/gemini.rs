//! # Gemini 家族编解码器
//!
//! generateContent 线格式；流式为 `alt=sse` 下的整块
//! GenerateContentResponse 序列，函数调用整体到达。

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::{Map, Value, json};

use super::canonical::{
    CanonicalMessage, CanonicalRequest, CanonicalResponse, FinishReason, ROLE_ASSISTANT,
    ROLE_SYSTEM, Segment, StreamDelta, ToolSpec,
};
use super::sse::{SseEvent, format_event};
use super::{
    BuildContext, ChannelFamily, ClientEmitter, DialectCodec, StreamDecoder, UpstreamRequestBody,
    UpstreamRequestParts,
};
use crate::error::{RelayError, Result};
use crate::relay::transport::build_upstream_url;
use crate::relay::usage::Usage;

/// Gemini 线格式中助手角色叫 model
const GEMINI_ROLE_MODEL: &str = "model";

/// Gemini 编解码器
pub struct GeminiCodec;

impl DialectCodec for GeminiCodec {
    fn family(&self) -> ChannelFamily {
        ChannelFamily::Gemini
    }

    fn build_chat_request(
        &self,
        ctx: &BuildContext<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamRequestParts> {
        let action = if ctx.is_stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let path = format!("/v1beta/models/{}:{action}", ctx.upstream_model);
        let mut url = build_upstream_url(ctx.base_url, &path, ChannelFamily::Gemini)?;
        if ctx.is_stream {
            url.push_str("?alt=sse");
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-goog-api-key"),
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
            body: UpstreamRequestBody::Json(canonical_to_generate_body(request)),
        })
    }

    fn parse_response(&self, body: &[u8], model: &str) -> Result<CanonicalResponse> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| RelayError::invalid_request(format!("上游响应不是合法 JSON: {e}")))?;
        parse_generate_response(&value, model)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GeminiStreamDecoder::default())
    }
}

// ---------------- 入站解析 ----------------

/// 解析 Gemini generateContent 请求体；模型名来自路径
pub fn parse_generate_request(model: &str, body: &Value) -> Result<CanonicalRequest> {
    let object = body
        .as_object()
        .ok_or_else(|| RelayError::invalid_request("请求体必须是 JSON 对象"))?;

    let mut request = CanonicalRequest::new(model);

    if let Some(instruction) = object.get("systemInstruction").or_else(|| object.get("system_instruction")) {
        let text = parts_text(instruction.get("parts"));
        if !text.is_empty() {
            request
                .messages
                .push(CanonicalMessage::text(ROLE_SYSTEM, text));
        }
    }

    let contents = object
        .get("contents")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::invalid_request("缺少 contents 字段"))?;
    if contents.is_empty() {
        return Err(RelayError::invalid_request("contents 不能为空"));
    }
    for content in contents {
        request.messages.push(parse_gemini_content(content));
    }

    if let Some(config) = object.get("generationConfig") {
        request.max_output_tokens = config
            .get("maxOutputTokens")
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX));
        request.temperature = config.get("temperature").and_then(Value::as_f64);
        request.top_p = config.get("topP").and_then(Value::as_f64);
        if let Some(stops) = config.get("stopSequences").and_then(Value::as_array) {
            request.stop = stops
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }

    if let Some(tools) = object.get("tools").and_then(Value::as_array) {
        for tool in tools {
            if let Some(declarations) =
                tool.get("functionDeclarations").and_then(Value::as_array)
            {
                for declaration in declarations {
                    let Some(name) = declaration.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    request.tools.push(ToolSpec {
                        name: name.to_string(),
                        description: declaration
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        parameters: declaration
                            .get("parameters")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    });
                }
            }
        }
    }

    Ok(request)
}

fn parts_text(parts: Option<&Value>) -> String {
    parts
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn parse_gemini_content(content: &Value) -> CanonicalMessage {
    let role = match content.get("role").and_then(Value::as_str) {
        Some(GEMINI_ROLE_MODEL) => ROLE_ASSISTANT,
        Some(role) => role,
        None => "user",
    };
    let mut segments = Vec::new();
    if let Some(parts) = content.get("parts").and_then(Value::as_array) {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    segments.push(Segment::Reasoning(text.to_string()));
                } else {
                    segments.push(Segment::Text(text.to_string()));
                }
            } else if let Some(call) = part.get("functionCall") {
                segments.push(Segment::ToolCall {
                    id: String::new(),
                    name: call
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call
                        .get("args")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                });
            } else if let Some(response) = part.get("functionResponse") {
                segments.push(Segment::ToolResult {
                    id: String::new(),
                    name: response
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    content: response
                        .get("response")
                        .map(Value::to_string)
                        .unwrap_or_default(),
                });
            } else if let Some(data) = part.get("inlineData").or_else(|| part.get("inline_data")) {
                let url = format!(
                    "data:{};base64,{}",
                    data.get("mimeType")
                        .or_else(|| data.get("mime_type"))
                        .and_then(Value::as_str)
                        .unwrap_or("application/octet-stream"),
                    data.get("data").and_then(Value::as_str).unwrap_or_default()
                );
                segments.push(Segment::ImageUrl(url));
            } else {
                segments.push(Segment::OpaqueJson {
                    label: "gemini_part".to_string(),
                    payload: part.clone(),
                });
            }
        }
    }
    CanonicalMessage {
        role: role.to_string(),
        segments,
    }
}

// ---------------- 上游请求体 ----------------

/// 规范请求 -> generateContent 请求体
#[must_use]
pub fn canonical_to_generate_body(request: &CanonicalRequest) -> Value {
    let mut body = Map::new();

    let system: String = request
        .messages
        .iter()
        .filter(|message| message.role == ROLE_SYSTEM)
        .map(CanonicalMessage::joined_text)
        .collect::<Vec<_>>()
        .join("\n");
    if !system.is_empty() {
        body.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }

    let mut contents = Vec::new();
    for message in &request.messages {
        if message.role == ROLE_SYSTEM {
            continue;
        }
        let role = if message.role == ROLE_ASSISTANT {
            GEMINI_ROLE_MODEL
        } else {
            "user"
        };
        let mut parts = Vec::new();
        for segment in &message.segments {
            match segment {
                Segment::Text(text) => parts.push(json!({"text": text})),
                Segment::Reasoning(text) => {
                    parts.push(json!({"text": text, "thought": true}));
                }
                Segment::ToolCall { name, arguments, .. } => {
                    let args: Value =
                        serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                    parts.push(json!({"functionCall": {"name": name, "args": args}}));
                }
                Segment::ToolResult { name, content, .. } => {
                    let response: Value = serde_json::from_str(content)
                        .unwrap_or_else(|_| json!({"result": content}));
                    parts.push(json!({
                        "functionResponse": {
                            "name": name.clone().unwrap_or_default(),
                            "response": response,
                        }
                    }));
                }
                Segment::ImageUrl(url) => {
                    if let Some(rest) = url.strip_prefix("data:") {
                        let (mime, data) =
                            rest.split_once(";base64,").unwrap_or(("image/png", rest));
                        parts.push(json!({
                            "inlineData": {"mimeType": mime, "data": data}
                        }));
                    } else {
                        parts.push(json!({
                            "fileData": {"fileUri": url}
                        }));
                    }
                }
                Segment::OpaqueJson { payload, .. } => parts.push(payload.clone()),
            }
        }
        contents.push(json!({"role": role, "parts": parts}));
    }
    body.insert("contents".to_string(), Value::Array(contents));

    let mut config = Map::new();
    if let Some(max) = request.max_output_tokens {
        config.insert("maxOutputTokens".to_string(), json!(max));
    }
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if !request.stop.is_empty() {
        config.insert("stopSequences".to_string(), json!(request.stop));
    }
    if !config.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(config));
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        body.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
    }
    Value::Object(body)
}

// ---------------- 响应解析 ----------------

fn map_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn parse_generate_response(value: &Value, model: &str) -> Result<CanonicalResponse> {
    let candidate = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .ok_or_else(|| RelayError::invalid_request("上游响应缺少 candidates"))?;

    let mut segments = Vec::new();
    let mut call_ordinal = 0u32;
    if let Some(parts) = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                    segments.push(Segment::Reasoning(text.to_string()));
                } else {
                    segments.push(Segment::Text(text.to_string()));
                }
            } else if let Some(call) = part.get("functionCall") {
                segments.push(Segment::ToolCall {
                    id: format!("call_{call_ordinal}"),
                    name: call
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call
                        .get("args")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                });
                call_ordinal += 1;
            }
        }
    }

    let has_tool_calls = call_ordinal > 0;
    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(map_finish_reason)
        .unwrap_or(FinishReason::Stop);
    let finish_reason = if has_tool_calls && finish_reason == FinishReason::Stop {
        FinishReason::ToolCalls
    } else {
        finish_reason
    };

    Ok(CanonicalResponse {
        model: value
            .get("modelVersion")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        role: ROLE_ASSISTANT.to_string(),
        segments,
        finish_reason,
        usage: parse_gemini_usage(value.get("usageMetadata")),
    })
}

/// usageMetadata -> 规范用量
pub fn parse_gemini_usage(value: Option<&Value>) -> Option<Usage> {
    let metadata = value?.as_object()?;
    let field = |key: &str| {
        metadata
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(0)
    };
    let mut usage = Usage {
        prompt_tokens: field("promptTokenCount"),
        completion_tokens: field("candidatesTokenCount"),
        cached_tokens: field("cachedContentTokenCount"),
        reasoning_tokens: field("thoughtsTokenCount"),
        total_tokens: field("totalTokenCount"),
        ..Usage::default()
    };
    if usage.is_empty() {
        return None;
    }
    usage.normalize();
    Some(usage)
}

/// 规范响应 -> generateContent 响应体
#[must_use]
pub fn response_to_json(response: &CanonicalResponse) -> Value {
    let mut parts = Vec::new();
    let reasoning = response.reasoning_text();
    if !reasoning.is_empty() {
        parts.push(json!({"text": reasoning, "thought": true}));
    }
    let text = response.output_text();
    if !text.is_empty() {
        parts.push(json!({"text": text}));
    }
    for (_, name, arguments) in response.tool_calls() {
        let args: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
        parts.push(json!({"functionCall": {"name": name, "args": args}}));
    }

    let usage = response.usage.unwrap_or_default();
    json!({
        "candidates": [{
            "content": {"role": GEMINI_ROLE_MODEL, "parts": parts},
            "finishReason": match response.finish_reason {
                FinishReason::Length => "MAX_TOKENS",
                FinishReason::ContentFilter => "SAFETY",
                _ => "STOP",
            },
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": usage.prompt_tokens,
            "candidatesTokenCount": usage.completion_tokens,
            "totalTokenCount": usage.total_tokens,
        },
        "modelVersion": response.model,
    })
}

// ---------------- 流式解码 ----------------

/// Gemini 流解码器；每个事件是一个完整的 GenerateContentResponse 增量
#[derive(Default)]
pub struct GeminiStreamDecoder {
    next_tool_ordinal: u32,
    latest_usage: Option<Usage>,
    finished: bool,
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamDelta>> {
        if event.data.trim().is_empty() {
            return Ok(vec![StreamDelta::Ignore]);
        }
        let value: Value = serde_json::from_str(event.data.trim())
            .map_err(|e| RelayError::invalid_request(format!("流事件不是合法 JSON: {e}")))?;

        let mut deltas = Vec::new();
        if let Some(candidate) = value
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
        {
            if let Some(parts) = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        if part
                            .get("thought")
                            .and_then(Value::as_bool)
                            .unwrap_or(false)
                        {
                            deltas.push(StreamDelta::Reasoning(text.to_string()));
                        } else {
                            deltas.push(StreamDelta::Content(text.to_string()));
                        }
                    } else if let Some(call) = part.get("functionCall") {
                        let ordinal = self.next_tool_ordinal;
                        self.next_tool_ordinal += 1;
                        deltas.push(StreamDelta::ToolCall {
                            index: ordinal,
                            id: Some(format!("call_{ordinal}")),
                            name: call
                                .get("name")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            args_fragment: None,
                            args_replace: Some(
                                call.get("args")
                                    .map(Value::to_string)
                                    .unwrap_or_else(|| "{}".to_string()),
                            ),
                        });
                    }
                }
            }
            if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                deltas.push(StreamDelta::Finish(map_finish_reason(reason)));
                self.finished = true;
            }
        }
        if let Some(usage) = parse_gemini_usage(value.get("usageMetadata")) {
            self.latest_usage = Some(usage);
        }
        if deltas.is_empty() {
            deltas.push(StreamDelta::Ignore);
        }
        Ok(deltas)
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>> {
        let mut deltas = Vec::new();
        if let Some(usage) = self.latest_usage.take() {
            deltas.push(StreamDelta::Usage(usage));
        }
        if self.finished {
            deltas.push(StreamDelta::Done);
        }
        Ok(deltas)
    }
}

// ---------------- 客户端发射 ----------------

/// generateContent 流式客户端发射器
pub struct ChunkEmitter {
    model: String,
    sent_finish: bool,
}

impl ChunkEmitter {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            sent_finish: false,
        }
    }

    fn chunk(&self, parts: Vec<Value>, finish: Option<&str>, usage: Option<&Usage>) -> String {
        let mut candidate = Map::new();
        candidate.insert(
            "content".to_string(),
            json!({"role": GEMINI_ROLE_MODEL, "parts": parts}),
        );
        if let Some(reason) = finish {
            candidate.insert("finishReason".to_string(), json!(reason));
        }
        candidate.insert("index".to_string(), json!(0));

        let mut body = Map::new();
        body.insert(
            "candidates".to_string(),
            Value::Array(vec![Value::Object(candidate)]),
        );
        if let Some(usage) = usage {
            body.insert(
                "usageMetadata".to_string(),
                json!({
                    "promptTokenCount": usage.prompt_tokens,
                    "candidatesTokenCount": usage.completion_tokens,
                    "totalTokenCount": usage.total_tokens,
                }),
            );
        }
        body.insert("modelVersion".to_string(), json!(self.model));
        format_event(None, &Value::Object(body).to_string())
    }
}

impl ClientEmitter for ChunkEmitter {
    fn emit(&mut self, delta: &StreamDelta) -> Vec<String> {
        match delta {
            StreamDelta::Content(text) => {
                vec![self.chunk(vec![json!({"text": text})], None, None)]
            }
            StreamDelta::Reasoning(text) => {
                vec![self.chunk(vec![json!({"text": text, "thought": true})], None, None)]
            }
            StreamDelta::ToolCall {
                name, args_replace, ..
            } => {
                // Gemini 线格式函数调用整体发射；仅在拿到完整参数时输出
                args_replace
                    .as_ref()
                    .map(|arguments| {
                        let args: Value = serde_json::from_str(arguments)
                            .unwrap_or_else(|_| json!({}));
                        vec![self.chunk(
                            vec![json!({
                                "functionCall": {
                                    "name": name.clone().unwrap_or_default(),
                                    "args": args,
                                }
                            })],
                            None,
                            None,
                        )]
                    })
                    .unwrap_or_default()
            }
            _ => Vec::new(),
        }
    }

    fn finish(&mut self, response: &CanonicalResponse) -> Vec<String> {
        if self.sent_finish {
            return Vec::new();
        }
        self.sent_finish = true;
        let reason = match response.finish_reason {
            FinishReason::Length => "MAX_TOKENS",
            FinishReason::ContentFilter => "SAFETY",
            _ => "STOP",
        };
        let usage = response.usage.unwrap_or_default();
        vec![self.chunk(Vec::new(), Some(reason), Some(&usage))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::codec::canonical::StreamAggregator;

    #[test]
    fn generate_request_parses_contents_and_config() {
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
            ],
            "systemInstruction": {"parts": [{"text": "be terse"}]},
            "generationConfig": {"maxOutputTokens": 256, "temperature": 0.3},
        });
        let request = parse_generate_request("gemini-1.5-pro", &body).unwrap();
        assert_eq!(request.model, "gemini-1.5-pro");
        assert_eq!(request.messages[0].role, ROLE_SYSTEM);
        assert_eq!(request.max_output_tokens, Some(256));
    }

    #[test]
    fn model_role_maps_to_assistant() {
        let content = json!({"role": "model", "parts": [{"text": "hello"}]});
        let message = parse_gemini_content(&content);
        assert_eq!(message.role, ROLE_ASSISTANT);
    }

    #[test]
    fn stream_decoder_accumulates_text_and_usage() {
        let mut decoder = GeminiStreamDecoder::default();
        let mut agg = StreamAggregator::new();
        let events = [
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]}),
            json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "lo"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5},
            }),
        ];
        for event in &events {
            for delta in decoder
                .decode(&SseEvent::data_only(event.to_string()))
                .unwrap()
            {
                agg.apply(&delta);
            }
        }
        for delta in decoder.finish().unwrap() {
            agg.apply(&delta);
        }
        assert!(agg.is_done());
        let response = agg.finish("gemini-1.5-pro");
        assert_eq!(response.output_text(), "Hello");
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn function_call_arrives_whole() {
        let mut decoder = GeminiStreamDecoder::default();
        let event = json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"name": "get_weather", "args": {"city": "SF"}}}
            ]}}],
        });
        let deltas = decoder
            .decode(&SseEvent::data_only(event.to_string()))
            .unwrap();
        assert!(matches!(
            &deltas[0],
            StreamDelta::ToolCall { name: Some(name), args_replace: Some(_), .. }
            if name == "get_weather"
        ));
    }

    #[test]
    fn round_trip_tool_call_through_body() {
        let mut request = CanonicalRequest::new("gemini-1.5-pro");
        request.messages.push(CanonicalMessage {
            role: ROLE_ASSISTANT.to_string(),
            segments: vec![Segment::ToolCall {
                id: "call_0".into(),
                name: "lookup".into(),
                arguments: "{\"q\":\"rust\"}".into(),
            }],
        });
        let body = canonical_to_generate_body(&request);
        assert_eq!(
            body["contents"][0]["parts"][0]["functionCall"]["name"],
            "lookup"
        );
        assert_eq!(
            body["contents"][0]["parts"][0]["functionCall"]["args"]["q"],
            "rust"
        );
    }
}
