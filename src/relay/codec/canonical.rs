//! # 方言中立的规范形
//!
//! 入站方言解析到这里，出站方言从这里生成；流式聚合器消费
//! `StreamDelta` 还原出与缓冲响应同形的 `CanonicalResponse`。

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::relay::usage::Usage;

/// 规范消息角色
pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL: &str = "tool";

/// 消息内容段
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// 纯文本
    Text(String),
    /// 推理/思考文本
    Reasoning(String),
    /// 工具调用（arguments 为 JSON 串）
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// 工具结果
    ToolResult {
        id: String,
        name: Option<String>,
        content: String,
    },
    /// 图像引用（URL 或 data URI）
    ImageUrl(String),
    /// 带标签的不透明 JSON 片段（跨方言保留）
    OpaqueJson { label: String, payload: Value },
}

impl Segment {
    /// 段内可计费文本
    #[must_use]
    pub fn billable_text(&self) -> &str {
        match self {
            Self::Text(text) | Self::Reasoning(text) => text,
            Self::ToolCall { arguments, .. } => arguments,
            Self::ToolResult { content, .. } => content,
            Self::ImageUrl(_) | Self::OpaqueJson { .. } => "",
        }
    }
}

/// 规范消息
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: String,
    pub segments: Vec<Segment>,
}

impl CanonicalMessage {
    #[must_use]
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            segments: vec![Segment::Text(text.into())],
        }
    }

    /// 段内全部文本拼接
    #[must_use]
    pub fn joined_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// 工具（函数）声明
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema
    pub parameters: Value,
}

/// 规范请求
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    /// 未识别的顶层字段；仅同方言转发时回填
    pub extra: Map<String, Value>,
}

impl CanonicalRequest {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            tools: Vec::new(),
            stream: false,
            max_output_tokens: None,
            temperature: None,
            top_p: None,
            stop: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// 结束原因（OpenAI 词汇为规范词汇）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    #[must_use]
    pub const fn as_openai(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
        }
    }

    #[must_use]
    pub const fn as_claude(&self) -> &'static str {
        match self {
            Self::Stop => "end_turn",
            Self::Length => "max_tokens",
            Self::ToolCalls => "tool_use",
            Self::ContentFilter => "refusal",
        }
    }

    #[must_use]
    pub fn from_claude(raw: &str) -> Self {
        match raw {
            "max_tokens" => Self::Length,
            "tool_use" => Self::ToolCalls,
            "refusal" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }

    #[must_use]
    pub fn from_openai(raw: &str) -> Self {
        match raw {
            "length" => Self::Length,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "content_filter" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }
}

/// 规范响应
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanonicalResponse {
    pub model: String,
    pub role: String,
    pub segments: Vec<Segment>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

impl CanonicalResponse {
    /// 输出文本段拼接
    #[must_use]
    pub fn output_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// 推理文本段拼接
    #[must_use]
    pub fn reasoning_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Reasoning(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// 工具调用段列表
    #[must_use]
    pub fn tool_calls(&self) -> Vec<(&str, &str, &str)> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// 解码后的流式增量
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// 角色声明
    Role(String),
    /// 文本增量
    Content(String),
    /// 推理文本增量
    Reasoning(String),
    /// 工具调用增量；`args_replace` 为完整参数串（与累积值取更长者）
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        args_fragment: Option<String>,
        args_replace: Option<String>,
    },
    /// 结束原因
    Finish(FinishReason),
    /// 末尾用量
    Usage(Usage),
    /// 流结束
    Done,
    /// 对聚合无意义的事件
    Ignore,
}

/// 聚合中的工具调用草稿
#[derive(Debug, Clone, Default, PartialEq)]
struct ToolCallDraft {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// 方言中立的流式聚合器。
///
/// 按上游到达顺序消费 `StreamDelta`；`finish` 产出与缓冲解析
/// 同形的规范响应，文本段与工具参数串与客户端收到的一致。
#[derive(Debug, Default)]
pub struct StreamAggregator {
    role: Option<String>,
    text: String,
    reasoning: String,
    tool_calls: BTreeMap<u32, ToolCallDraft>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    done: bool,
}

impl StreamAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: &StreamDelta) {
        match delta {
            StreamDelta::Role(role) => {
                if self.role.is_none() {
                    self.role = Some(role.clone());
                }
            }
            StreamDelta::Content(text) => self.text.push_str(text),
            StreamDelta::Reasoning(text) => self.reasoning.push_str(text),
            StreamDelta::ToolCall {
                index,
                id,
                name,
                args_fragment,
                args_replace,
            } => {
                let draft = self.tool_calls.entry(*index).or_default();
                if draft.id.is_none() {
                    draft.id.clone_from(id);
                }
                if draft.name.is_none() {
                    draft.name.clone_from(name);
                }
                if let Some(fragment) = args_fragment {
                    draft.arguments.push_str(fragment);
                }
                if let Some(replacement) = args_replace {
                    // 截断不会让 JSON 变长：两个来源不一致时取更长者
                    if replacement.len() > draft.arguments.len() {
                        draft.arguments.clone_from(replacement);
                    }
                }
            }
            StreamDelta::Finish(reason) => self.finish_reason = Some(*reason),
            StreamDelta::Usage(usage) => self.usage = Some(*usage),
            StreamDelta::Done => self.done = true,
            StreamDelta::Ignore => {}
        }
    }

    /// 到达流尾时是否看到显式结束
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// 已累计的输出文本长度（部分交付计费用）
    #[must_use]
    pub fn delivered_text_len(&self) -> usize {
        self.text.len()
    }

    /// 收口为规范响应
    #[must_use]
    pub fn finish(self, model: &str) -> CanonicalResponse {
        let mut segments = Vec::new();
        if !self.reasoning.is_empty() {
            segments.push(Segment::Reasoning(self.reasoning));
        }
        if !self.text.is_empty() {
            segments.push(Segment::Text(self.text));
        }
        let has_tool_calls = !self.tool_calls.is_empty();
        for (index, draft) in self.tool_calls {
            segments.push(Segment::ToolCall {
                id: draft.id.unwrap_or_else(|| format!("call_{index}")),
                name: draft.name.unwrap_or_default(),
                arguments: draft.arguments,
            });
        }
        let finish_reason = self.finish_reason.unwrap_or(if has_tool_calls {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });
        CanonicalResponse {
            model: model.to_string(),
            role: self.role.unwrap_or_else(|| ROLE_ASSISTANT.to_string()),
            segments,
            finish_reason,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregator_concatenates_content_in_order() {
        let mut agg = StreamAggregator::new();
        for chunk in ["A", "B", "C"] {
            agg.apply(&StreamDelta::Content(chunk.to_string()));
        }
        let response = agg.finish("gpt-4o-mini");
        assert_eq!(response.output_text(), "ABC");
        assert_eq!(response.role, ROLE_ASSISTANT);
    }

    #[test]
    fn tool_call_fragments_merge_by_index() {
        let mut agg = StreamAggregator::new();
        agg.apply(&StreamDelta::ToolCall {
            index: 0,
            id: Some("call_1".into()),
            name: Some("get_weather".into()),
            args_fragment: Some("{\"city\":".into()),
            args_replace: None,
        });
        agg.apply(&StreamDelta::ToolCall {
            index: 0,
            id: None,
            name: None,
            args_fragment: Some("\"SF\"}".into()),
            args_replace: None,
        });
        let response = agg.finish("gpt-4o");
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("call_1", "get_weather", "{\"city\":\"SF\"}"));
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn longer_arguments_win_on_replace() {
        let mut agg = StreamAggregator::new();
        agg.apply(&StreamDelta::ToolCall {
            index: 0,
            id: Some("c".into()),
            name: Some("f".into()),
            args_fragment: Some("{\"a\":1,\"b\":2}".into()),
            args_replace: None,
        });
        // done 载荷被截断时保留更长的累积值
        agg.apply(&StreamDelta::ToolCall {
            index: 0,
            id: None,
            name: None,
            args_fragment: None,
            args_replace: Some("{\"a\":1}".into()),
        });
        let response = agg.finish("gpt-4o");
        assert_eq!(response.tool_calls()[0].2, "{\"a\":1,\"b\":2}");

        let mut agg = StreamAggregator::new();
        agg.apply(&StreamDelta::ToolCall {
            index: 0,
            id: Some("c".into()),
            name: Some("f".into()),
            args_fragment: Some("{\"a\"".into()),
            args_replace: None,
        });
        agg.apply(&StreamDelta::ToolCall {
            index: 0,
            id: None,
            name: None,
            args_fragment: None,
            args_replace: Some("{\"a\":1}".into()),
        });
        let response = agg.finish("gpt-4o");
        assert_eq!(response.tool_calls()[0].2, "{\"a\":1}");
    }

    #[test]
    fn usage_and_finish_survive_aggregation() {
        let mut agg = StreamAggregator::new();
        agg.apply(&StreamDelta::Content("hi".into()));
        agg.apply(&StreamDelta::Finish(FinishReason::Length));
        agg.apply(&StreamDelta::Usage(Usage {
            prompt_tokens: 1,
            completion_tokens: 3,
            total_tokens: 4,
            ..Usage::default()
        }));
        agg.apply(&StreamDelta::Done);
        assert!(agg.is_done());
        let response = agg.finish("gpt-4o-mini");
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.usage.unwrap().total_tokens, 4);
    }
}
