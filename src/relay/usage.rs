//! # 用量解析与对账
//!
//! 上游上报的用量优先；缺失时用确定性估算器补齐。估算器不追求
//! 与上游分词器逐字一致，只保证 (模型, 文本) 给定时结果稳定，
//! 使计费可复现。

use serde::{Deserialize, Serialize};

use crate::relay::codec::canonical::{CanonicalRequest, CanonicalResponse};
use crate::types::TokenCount;

/// 规范用量记录
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: TokenCount,
    pub completion_tokens: TokenCount,
    pub cached_tokens: TokenCount,
    pub reasoning_tokens: TokenCount,
    pub image_tokens: TokenCount,
    pub total_tokens: TokenCount,
}

impl Usage {
    /// 归一化：补齐缺失的 total 并保证 `total >= prompt + completion`
    pub fn normalize(&mut self) {
        let floor = self.prompt_tokens.saturating_add(self.completion_tokens);
        if self.total_tokens < floor {
            self.total_tokens = floor;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// 用量数字的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSource {
    /// 全部来自上游
    Reported,
    /// 全部来自本地估算
    Computed,
    /// 两侧都有，上报值优先
    Reconciled,
}

impl UsageSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reported => "reported",
            Self::Computed => "computed",
            Self::Reconciled => "reconciled",
        }
    }
}

/// 每条消息的格式开销与回复引导开销（对齐聊天模板的惯例值）
const MESSAGE_OVERHEAD_TOKENS: TokenCount = 4;
const REPLY_PRIMER_TOKENS: TokenCount = 3;

/// 确定性文本 token 估算。
///
/// ASCII 字节按 4 字节一 token 向上取整，非 ASCII 码点各计一个；
/// 与主流 BPE 的量级一致且完全可复现。
#[must_use]
pub fn estimate_text_tokens(text: &str) -> TokenCount {
    if text.is_empty() {
        return 0;
    }
    let mut ascii_bytes: u64 = 0;
    let mut wide_chars: u64 = 0;
    for ch in text.chars() {
        if ch.is_ascii() {
            ascii_bytes += 1;
        } else {
            wide_chars += 1;
        }
    }
    let ascii_tokens = ascii_bytes.div_ceil(4);
    TokenCount::try_from(ascii_tokens + wide_chars).unwrap_or(TokenCount::MAX)
}

/// 估算请求侧 prompt tokens
#[must_use]
pub fn estimate_prompt_tokens(request: &CanonicalRequest) -> TokenCount {
    let mut total: TokenCount = REPLY_PRIMER_TOKENS;
    for message in &request.messages {
        total = total.saturating_add(MESSAGE_OVERHEAD_TOKENS);
        total = total.saturating_add(estimate_text_tokens(&message.role));
        for segment in &message.segments {
            total = total.saturating_add(estimate_text_tokens(segment.billable_text()));
        }
    }
    for tool in &request.tools {
        total = total.saturating_add(estimate_text_tokens(&tool.name));
        total = total.saturating_add(estimate_text_tokens(
            &tool.parameters.to_string(),
        ));
    }
    total
}

/// 估算响应侧 completion tokens（文本 + 工具参数 + 推理）
#[must_use]
pub fn estimate_completion_tokens(response: &CanonicalResponse) -> TokenCount {
    let mut total = estimate_text_tokens(&response.output_text());
    total = total.saturating_add(estimate_text_tokens(&response.reasoning_text()));
    for (_, name, arguments) in response.tool_calls() {
        total = total.saturating_add(estimate_text_tokens(name));
        total = total.saturating_add(estimate_text_tokens(arguments));
    }
    total
}

/// 上报值与估算值相差超过此比例时记录分歧信号
const DISCREPANCY_RATIO: f64 = 0.10;

/// 对账：上报值优先，缺失时回退估算
#[must_use]
pub fn reconcile(
    request_id: &str,
    reported: Option<Usage>,
    computed: Usage,
) -> (Usage, UsageSource) {
    match reported {
        None => {
            let mut usage = computed;
            usage.normalize();
            (usage, UsageSource::Computed)
        }
        Some(mut usage) if usage.is_empty() => {
            usage = computed;
            usage.normalize();
            (usage, UsageSource::Computed)
        }
        Some(mut usage) => {
            usage.normalize();
            let source = if computed.is_empty() {
                UsageSource::Reported
            } else {
                log_discrepancy(request_id, &usage, &computed);
                UsageSource::Reconciled
            };
            (usage, source)
        }
    }
}

fn log_discrepancy(request_id: &str, reported: &Usage, computed: &Usage) {
    let reported_total = f64::from(reported.total_tokens);
    let computed_total =
        f64::from(computed.prompt_tokens.saturating_add(computed.completion_tokens));
    if reported_total <= 0.0 {
        return;
    }
    let drift = (reported_total - computed_total).abs() / reported_total;
    if drift > DISCREPANCY_RATIO {
        crate::lwarn!(
            request_id,
            crate::logging::LogStage::Response,
            crate::logging::LogComponent::Usage,
            "usage_discrepancy",
            "上游用量与本地估算分歧超过阈值",
            reported_total = reported.total_tokens,
            computed_total = computed_total,
            drift = drift
        );
    }
}
