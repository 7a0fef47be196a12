//! # 方言编解码器
//!
//! 每个服务商家族一个编解码器实例：构造上游请求、解析缓冲响应、
//! 解码流式事件；客户端侧按入站方言再发射。家族集合是封闭的，
//! 调度时按 `family -> codec` 查表选取。

pub mod canonical;
pub mod claude;
pub mod gemini;
pub mod openai;
pub mod responses;
pub mod sse;

use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::Value;

use crate::error::{RelayError, Result};
use canonical::{CanonicalRequest, CanonicalResponse, StreamDelta};
use sse::SseEvent;

/// 上游服务商家族（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelFamily {
    OpenAi,
    Azure,
    Claude,
    Gemini,
}

impl ChannelFamily {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Azure => "azure",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }

    /// 渠道表 `family` 字段解析
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "azure" | "azure_openai" => Ok(Self::Azure),
            "claude" | "anthropic" => Ok(Self::Claude),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(RelayError::config(format!("未知服务商家族: {other}"))),
        }
    }

    /// OpenAI 兼容线格式（URL 拼接规则、透传判定用）
    #[must_use]
    pub const fn is_openai_wire(&self) -> bool {
        matches!(self, Self::OpenAi | Self::Azure)
    }
}

/// 入站 API 方言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiDialect {
    ChatCompletions,
    Completions,
    Embeddings,
    ImagesGenerations,
    AudioTranscriptions,
    AudioTranslations,
    AudioSpeech,
    Responses,
    ClaudeMessages,
    GeminiGenerateContent,
}

impl ApiDialect {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::ImagesGenerations => "images_generations",
            Self::AudioTranscriptions => "audio_transcriptions",
            Self::AudioTranslations => "audio_translations",
            Self::AudioSpeech => "audio_speech",
            Self::Responses => "responses",
            Self::ClaudeMessages => "claude_messages",
            Self::GeminiGenerateContent => "gemini_generate_content",
        }
    }

    /// 可做跨家族翻译的聊天类方言
    #[must_use]
    pub const fn is_chat_like(&self) -> bool {
        matches!(
            self,
            Self::ChatCompletions
                | Self::Responses
                | Self::ClaudeMessages
                | Self::GeminiGenerateContent
        )
    }

    /// OpenAI 线格式下的请求路径
    #[must_use]
    pub const fn openai_path(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "/v1/chat/completions",
            Self::Completions => "/v1/completions",
            Self::Embeddings => "/v1/embeddings",
            Self::ImagesGenerations => "/v1/images/generations",
            Self::AudioTranscriptions => "/v1/audio/transcriptions",
            Self::AudioTranslations => "/v1/audio/translations",
            Self::AudioSpeech => "/v1/audio/speech",
            Self::Responses => "/v1/responses",
            // 原生方言走各自家族的路径构造
            Self::ClaudeMessages => "/v1/messages",
            Self::GeminiGenerateContent => "/v1beta/models",
        }
    }

    /// 该方言的原生线格式家族
    #[must_use]
    pub const fn native_family(&self) -> ChannelFamily {
        match self {
            Self::ClaudeMessages => ChannelFamily::Claude,
            Self::GeminiGenerateContent => ChannelFamily::Gemini,
            _ => ChannelFamily::OpenAi,
        }
    }

    /// 入站方言与上游家族是否同线格式（可逐字节透传）
    #[must_use]
    pub fn same_wire(&self, family: ChannelFamily) -> bool {
        match self {
            Self::ClaudeMessages => family == ChannelFamily::Claude,
            Self::GeminiGenerateContent => family == ChannelFamily::Gemini,
            // Responses 与 Azure 部署形状不同，仅 OpenAI 原生透传
            Self::Responses => family == ChannelFamily::OpenAi,
            _ => family.is_openai_wire(),
        }
    }
}

/// 构造上游请求所需的每次尝试上下文
#[derive(Debug, Clone)]
pub struct BuildContext<'a> {
    pub request_id: &'a str,
    pub dialect: ApiDialect,
    pub base_url: &'a str,
    /// 本次尝试从渠道密钥池选中的密钥
    pub api_key: &'a str,
    /// 经渠道重写表映射后的上游模型名
    pub upstream_model: &'a str,
    pub is_stream: bool,
    /// 客户端未限制输出时的上限兜底
    pub max_output_tokens_default: u32,
}

/// 已物化的上游请求
#[derive(Debug)]
pub struct UpstreamRequestParts {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: UpstreamRequestBody,
}

/// 上游请求体
#[derive(Debug)]
pub enum UpstreamRequestBody {
    Json(Value),
    Binary { bytes: Bytes, content_type: String },
}

/// 单服务商家族的方言编解码器
pub trait DialectCodec: Send + Sync {
    fn family(&self) -> ChannelFamily;

    /// 规范请求 -> 完整上游请求（URL、头、体、流开关）
    fn build_chat_request(
        &self,
        ctx: &BuildContext<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamRequestParts>;

    /// 解码非流式响应体
    fn parse_response(&self, body: &[u8], model: &str) -> Result<CanonicalResponse>;

    /// 新建流解码器；解码器持有本连接的状态袋
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;
}

/// 上游流式事件解码器
pub trait StreamDecoder: Send {
    /// 解码一个 SSE 事件
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamDelta>>;

    /// 流自然结束时冲出残余增量（如末尾用量）
    fn finish(&mut self) -> Result<Vec<StreamDelta>> {
        Ok(Vec::new())
    }
}

/// 客户端方言的流式发射器。
///
/// 每个增量产出零或多条 SSE 帧；全部帧聚合后与
/// `parse_response` 在整体缓冲下得到的规范响应同形。
pub trait ClientEmitter: Send {
    fn emit(&mut self, delta: &StreamDelta) -> Vec<String>;

    /// 流尾收口：补齐结束帧与用量帧
    fn finish(&mut self, response: &CanonicalResponse) -> Vec<String>;
}

static OPENAI_CODEC: openai::OpenAiCodec = openai::OpenAiCodec;
static AZURE_CODEC: openai::AzureCodec = openai::AzureCodec;
static CLAUDE_CODEC: claude::ClaudeCodec = claude::ClaudeCodec;
static GEMINI_CODEC: gemini::GeminiCodec = gemini::GeminiCodec;

/// 家族到编解码器的静态映射
#[must_use]
pub fn codec_for(family: ChannelFamily) -> &'static dyn DialectCodec {
    match family {
        ChannelFamily::OpenAi => &OPENAI_CODEC,
        ChannelFamily::Azure => &AZURE_CODEC,
        ChannelFamily::Claude => &CLAUDE_CODEC,
        ChannelFamily::Gemini => &GEMINI_CODEC,
    }
}

/// 上游响应解析；Responses 方言在 OpenAI 渠道上走事件化线格式
pub fn upstream_parse_response(
    family: ChannelFamily,
    dialect: ApiDialect,
    body: &[u8],
    model: &str,
) -> Result<CanonicalResponse> {
    if family == ChannelFamily::OpenAi && dialect == ApiDialect::Responses {
        return responses::parse_responses_response(body, model);
    }
    codec_for(family).parse_response(body, model)
}

/// 上游流解码器；同上按 (家族, 方言) 选取
#[must_use]
pub fn upstream_stream_decoder(
    family: ChannelFamily,
    dialect: ApiDialect,
) -> Box<dyn StreamDecoder> {
    if family == ChannelFamily::OpenAi && dialect == ApiDialect::Responses {
        return Box::new(responses::ResponsesStreamDecoder::default());
    }
    codec_for(family).stream_decoder()
}

/// 入站方言 -> 规范请求
pub fn parse_inbound(dialect: ApiDialect, model: &str, body: &Value) -> Result<CanonicalRequest> {
    match dialect {
        ApiDialect::ChatCompletions => openai::parse_chat_request(body),
        ApiDialect::Responses => responses::parse_responses_request(body),
        ApiDialect::ClaudeMessages => claude::parse_messages_request(body),
        ApiDialect::GeminiGenerateContent => gemini::parse_generate_request(model, body),
        other => Err(RelayError::invalid_request(format!(
            "方言 {} 不支持规范化解析",
            other.as_str()
        ))),
    }
}

/// 规范响应 -> 客户端方言的缓冲响应体
pub fn render_response(
    dialect: ApiDialect,
    response: &CanonicalResponse,
    request_id: &str,
) -> Result<Value> {
    match dialect {
        ApiDialect::ChatCompletions => Ok(openai::response_to_json(response, request_id)),
        ApiDialect::Responses => Ok(responses::response_to_json(response, request_id)),
        ApiDialect::ClaudeMessages => Ok(claude::response_to_json(response, request_id)),
        ApiDialect::GeminiGenerateContent => Ok(gemini::response_to_json(response)),
        other => Err(RelayError::invalid_request(format!(
            "方言 {} 不支持响应重建",
            other.as_str()
        ))),
    }
}

/// 入站方言的流式发射器
pub fn emitter_for(
    dialect: ApiDialect,
    model: &str,
    request_id: &str,
) -> Result<Box<dyn ClientEmitter>> {
    match dialect {
        ApiDialect::ChatCompletions => {
            Ok(Box::new(openai::ChunkEmitter::new(model, request_id)))
        }
        ApiDialect::Responses => Ok(Box::new(responses::EventEmitter::new(model, request_id))),
        ApiDialect::ClaudeMessages => Ok(Box::new(claude::EventEmitter::new(model, request_id))),
        ApiDialect::GeminiGenerateContent => Ok(Box::new(gemini::ChunkEmitter::new(model))),
        other => Err(RelayError::invalid_request(format!(
            "方言 {} 不支持流式输出",
            other.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_parse_accepts_aliases() {
        assert_eq!(ChannelFamily::parse("openai").unwrap(), ChannelFamily::OpenAi);
        assert_eq!(
            ChannelFamily::parse("Anthropic").unwrap(),
            ChannelFamily::Claude
        );
        assert_eq!(ChannelFamily::parse("google").unwrap(), ChannelFamily::Gemini);
        assert!(ChannelFamily::parse("bedrock-x").is_err());
    }

    #[test]
    fn same_wire_matrix() {
        assert!(ApiDialect::ChatCompletions.same_wire(ChannelFamily::OpenAi));
        assert!(ApiDialect::ChatCompletions.same_wire(ChannelFamily::Azure));
        assert!(!ApiDialect::ChatCompletions.same_wire(ChannelFamily::Claude));
        assert!(ApiDialect::ClaudeMessages.same_wire(ChannelFamily::Claude));
        assert!(!ApiDialect::Responses.same_wire(ChannelFamily::Azure));
        assert!(ApiDialect::GeminiGenerateContent.same_wire(ChannelFamily::Gemini));
    }

    #[test]
    fn chat_like_dialects_are_translatable() {
        assert!(ApiDialect::ClaudeMessages.is_chat_like());
        assert!(!ApiDialect::Embeddings.is_chat_like());
        assert!(!ApiDialect::AudioSpeech.is_chat_like());
    }
}
