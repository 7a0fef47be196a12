//! # 请求上下文
//!
//! `RelayInfo` 是单请求的草稿记录：鉴权、路由、计量状态随管道
//! 推进被逐步填充，重试推进时已试渠道集合同步更新。

use http::HeaderMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use bytes::Bytes;

use crate::auth::AuthContext;
use crate::channel::ChannelMeta;
use crate::relay::capture::PayloadCapture;
use crate::relay::codec::{ApiDialect, canonical::CanonicalRequest};
use crate::types::{ChannelId, TokenCount};

/// 入站载荷：聊天类走规范形，其余按线格式透传
pub enum InboundPayload {
    /// 可跨家族翻译的聊天类请求
    Chat(CanonicalRequest),
    /// JSON 透传（embeddings / images / speech / legacy completions）
    Json(Value),
    /// 二进制透传（音频转写的 multipart 表单）
    Binary {
        bytes: Bytes,
        content_type: String,
    },
}

impl InboundPayload {
    /// 是否请求了流式输出
    #[must_use]
    pub fn wants_stream(&self) -> bool {
        match self {
            Self::Chat(request) => request.stream,
            Self::Json(body) => body
                .get("stream")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Self::Binary { .. } => false,
        }
    }
}

/// 单请求草稿记录
pub struct RelayInfo {
    pub request_id: String,
    pub dialect: ApiDialect,
    pub requested_model: String,
    pub is_stream: bool,
    pub auth: AuthContext,
    /// 当前尝试选中的渠道；重试时被覆盖
    pub channel: Option<Arc<ChannelMeta>>,
    pub first_channel_id: Option<ChannelId>,
    pub tried: HashSet<ChannelId>,
    pub attempts: u32,
    /// 渠道连通性测试请求（跳过透传规则与 client_header 占位符）
    pub is_channel_test: bool,
    pub client_ip: Option<String>,
    pub inbound_headers: HeaderMap,
    pub started_at: Instant,
    pub deadline: Instant,
    pub first_byte_at: Option<Instant>,
    pub request_capture: PayloadCapture,
    pub response_capture: PayloadCapture,
    /// 预扣时算好的 prompt token 估计，收口对账复用
    pub prompt_tokens_estimate: TokenCount,
    /// 最后一次上游错误体原文（仅日志）
    pub last_upstream_error: Option<String>,
}

impl RelayInfo {
    #[must_use]
    pub fn new(
        dialect: ApiDialect,
        requested_model: String,
        is_stream: bool,
        auth: AuthContext,
        inbound_headers: HeaderMap,
        client_ip: Option<String>,
        timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            request_id: Uuid::new_v4().simple().to_string(),
            dialect,
            requested_model,
            is_stream,
            auth,
            channel: None,
            first_channel_id: None,
            tried: HashSet::new(),
            attempts: 0,
            is_channel_test: false,
            client_ip,
            inbound_headers,
            started_at: now,
            deadline: now + timeout,
            first_byte_at: None,
            request_capture: PayloadCapture::new(),
            response_capture: PayloadCapture::new(),
            prompt_tokens_estimate: 0,
            last_upstream_error: None,
        }
    }

    /// 截止时间剩余量；耗尽时为零
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// 记录首字节时刻（只记第一次）
    pub fn mark_first_byte(&mut self) {
        if self.first_byte_at.is_none() {
            self.first_byte_at = Some(Instant::now());
        }
    }

    /// 首字节延迟（毫秒）
    #[must_use]
    pub fn first_byte_ms(&self) -> Option<i64> {
        self.first_byte_at
            .map(|at| i64::try_from(at.duration_since(self.started_at).as_millis()).unwrap_or(i64::MAX))
    }

    /// 总延迟（毫秒）
    #[must_use]
    pub fn latency_ms(&self) -> i64 {
        i64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}
