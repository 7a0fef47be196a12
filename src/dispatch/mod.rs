//! # 调度器
//!
//! 按优先级分桶、桶内加权随机选渠道；失败按错误类别决定
//! 立即换道、冷却换道、自动禁用或终止。总墙钟截止时间一到
//! 不再发起新尝试。

use rand::Rng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelMeta, ChannelRegistry, CooldownMap};
use crate::config::AppConfig;
use crate::error::{RelayError, Result, RetryClass};
use crate::logging::{LogComponent, LogStage};
use crate::relay::codec::{
    self, BuildContext, ChannelFamily, UpstreamRequestBody, UpstreamRequestParts,
};
use crate::relay::context::{InboundPayload, RelayInfo};
use crate::relay::transport::{
    self, UpstreamReply, UpstreamTransport, build_upstream_url,
};
use crate::types::ChannelId;
use crate::{ldebug, linfo, lwarn};

/// 一次成功调度的产出
pub struct DispatchSuccess {
    pub channel: Arc<ChannelMeta>,
    pub reply: UpstreamReply,
}

/// 调度器
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    cooldowns: Arc<CooldownMap>,
    transport: Arc<UpstreamTransport>,
    config: Arc<AppConfig>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<ChannelRegistry>,
        cooldowns: Arc<CooldownMap>,
        transport: Arc<UpstreamTransport>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            registry,
            cooldowns,
            transport,
            config,
        }
    }

    /// 重试循环：候选耗尽、尝试数耗尽或截止时间耗尽时停止。
    pub async fn dispatch(
        &self,
        info: &mut RelayInfo,
        payload: &InboundPayload,
        cancel: &CancellationToken,
    ) -> Result<DispatchSuccess> {
        let model = info.requested_model.clone();
        let candidates =
            self.registry
                .candidates(&model, &info.auth.groups, &self.cooldowns);
        if candidates.is_empty() {
            return Err(RelayError::NoChannel { model });
        }

        let mut last_error: Option<RelayError> = None;
        let mut candidates_exhausted = false;
        for attempt in 0..self.config.relay.max_retries {
            if info.remaining().is_zero() {
                lwarn!(
                    &info.request_id,
                    LogStage::UpstreamRequest,
                    LogComponent::Dispatcher,
                    "deadline_exhausted",
                    "请求截止时间耗尽，停止新尝试",
                    attempt = attempt
                );
                break;
            }
            let Some(channel) = select_channel(&candidates, &info.tried) else {
                candidates_exhausted = true;
                break;
            };
            info.attempts = attempt + 1;
            info.tried.insert(channel.id);
            if info.first_channel_id.is_none() {
                info.first_channel_id = Some(channel.id);
            }
            info.channel = Some(Arc::clone(&channel));

            ldebug!(
                &info.request_id,
                LogStage::Scheduling,
                LogComponent::Dispatcher,
                "channel_selected",
                "已选择渠道",
                channel_id = channel.id,
                channel_name = %channel.name,
                attempt = info.attempts
            );

            let attempt_result = self.attempt(info, &channel, payload, cancel).await;
            match attempt_result {
                Ok(reply) => {
                    self.registry.record_success(channel.id);
                    return Ok(DispatchSuccess { channel, reply });
                }
                Err(err) => {
                    info.last_upstream_error = Some(err.to_string());
                    match err.retry_class() {
                        RetryClass::RetryableNow => {
                            linfo!(
                                &info.request_id,
                                LogStage::ResponseFailure,
                                LogComponent::Dispatcher,
                                "retry_scheduled",
                                "渠道失败，立即换道重试",
                                channel_id = channel.id,
                                error = %err
                            );
                            last_error = Some(err);
                        }
                        RetryClass::RetryableWithCooldown => {
                            let cooldown = match &err {
                                RelayError::ChannelRetryable {
                                    cooldown: Some(cooldown),
                                    ..
                                } => *cooldown,
                                _ => self.config.relay.retry_cooldown(),
                            };
                            self.cooldowns.set(channel.id, &model, cooldown);
                            linfo!(
                                &info.request_id,
                                LogStage::ResponseFailure,
                                LogComponent::Dispatcher,
                                "cooldown_applied",
                                "渠道失败，写入冷却后换道重试",
                                channel_id = channel.id,
                                cooldown_secs = cooldown.as_secs(),
                                error = %err
                            );
                            last_error = Some(err);
                        }
                        RetryClass::FatalChannel => {
                            self.registry
                                .record_fatal(channel.id, &info.request_id)
                                .await?;
                            last_error = Some(err);
                        }
                        RetryClass::FatalRequest => return Err(err),
                    }
                }
            }
        }

        // 候选耗尽降级为无渠道可用（整单退款）；仅尝试数耗尽时透出末次错误
        if candidates_exhausted {
            return Err(RelayError::NoChannel { model });
        }
        Err(last_error.unwrap_or(RelayError::NoChannel { model }))
    }

    /// 单次尝试：构造上游请求（凭证、重写、头部卫生）并执行
    async fn attempt(
        &self,
        info: &RelayInfo,
        channel: &Arc<ChannelMeta>,
        payload: &InboundPayload,
        cancel: &CancellationToken,
    ) -> Result<UpstreamReply> {
        // 本次尝试固定一把密钥，凭证注入与 {channel_key} 占位符一致
        let api_key = channel.pick_key().to_string();
        let mut parts = self.build_parts(info, channel, payload, &api_key)?;
        self.apply_channel_headers(info, channel, &api_key, &mut parts)?;
        self.transport
            .execute(
                parts,
                info.remaining(),
                cancel,
                self.config.relay.retry_cooldown(),
            )
            .await
    }

    fn build_parts(
        &self,
        info: &RelayInfo,
        channel: &Arc<ChannelMeta>,
        payload: &InboundPayload,
        api_key: &str,
    ) -> Result<UpstreamRequestParts> {
        let upstream_model = channel.resolve_model(&info.requested_model);
        let ctx = BuildContext {
            request_id: &info.request_id,
            dialect: info.dialect,
            base_url: &channel.base_url,
            api_key,
            upstream_model: &upstream_model,
            is_stream: info.is_stream,
            max_output_tokens_default: self.config.relay.max_output_tokens_default,
        };

        match payload {
            InboundPayload::Chat(request) => {
                let codec = codec::codec_for(channel.family);
                if info.dialect.same_wire(channel.family) {
                    codec.build_chat_request(&ctx, request)
                } else {
                    // 跨线格式翻译时丢弃入站方言的私有字段
                    let mut translated = request.clone();
                    translated.extra.clear();
                    codec.build_chat_request(&ctx, &translated)
                }
            }
            InboundPayload::Json(body) => {
                build_openai_passthrough(&ctx, channel.family, body.clone())
            }
            InboundPayload::Binary {
                bytes,
                content_type,
            } => {
                if channel.family != ChannelFamily::OpenAi {
                    return Err(RelayError::invalid_request(format!(
                        "方言 {} 不支持 {} 渠道",
                        info.dialect.as_str(),
                        channel.family.as_str()
                    )));
                }
                let url = build_upstream_url(
                    &channel.base_url,
                    info.dialect.openai_path(),
                    ChannelFamily::OpenAi,
                )?;
                let mut headers = http::HeaderMap::new();
                headers.insert(
                    http::header::AUTHORIZATION,
                    codec::openai::bearer_value(ctx.api_key)?,
                );
                Ok(UpstreamRequestParts {
                    method: http::Method::POST,
                    url,
                    headers,
                    body: UpstreamRequestBody::Binary {
                        bytes: bytes.clone(),
                        content_type: content_type.clone(),
                    },
                })
            }
        }
    }

    /// 渠道级头部处理：透传过滤 + 覆盖模板
    fn apply_channel_headers(
        &self,
        info: &RelayInfo,
        channel: &Arc<ChannelMeta>,
        api_key: &str,
        parts: &mut UpstreamRequestParts,
    ) -> Result<()> {
        let overrides = transport::resolve_header_overrides(
            &channel.header_override,
            &info.inbound_headers,
            api_key,
            &info.request_id,
            info.is_channel_test,
        )?;

        if channel.pass_through && !info.is_channel_test && !overrides.suppress_client_headers {
            // 凭证头与 content-type 由编解码器设置，透传时一并拒绝客户端同名头
            let codec_names: Vec<String> = parts
                .headers
                .keys()
                .map(|name| name.as_str().to_string())
                .collect();
            let extra: Vec<&str> = codec_names.iter().map(String::as_str).collect();
            let deny = transport::build_pass_through_deny_set(&info.inbound_headers, &extra);
            let mut merged = http::HeaderMap::new();
            transport::copy_headers_except(&mut merged, &info.inbound_headers, &deny);
            for (name, value) in merged {
                if let Some(name) = name {
                    parts.headers.append(name, value);
                }
            }
        }

        for (name, value) in overrides.headers {
            parts.headers.insert(name, value);
        }
        Ok(())
    }

}

/// JSON 透传载荷只发往 OpenAI 线格式渠道；模型名经重写表替换
fn build_openai_passthrough(
    ctx: &BuildContext<'_>,
    family: ChannelFamily,
    mut body: serde_json::Value,
) -> Result<UpstreamRequestParts> {
    if family != ChannelFamily::OpenAi {
        return Err(RelayError::invalid_request(format!(
            "方言 {} 不支持 {} 渠道",
            ctx.dialect.as_str(),
            family.as_str()
        )));
    }
    if let Some(object) = body.as_object_mut() {
        if object.contains_key("model") {
            object.insert(
                "model".to_string(),
                serde_json::Value::String(ctx.upstream_model.to_string()),
            );
        }
    }
    let url = build_upstream_url(ctx.base_url, ctx.dialect.openai_path(), family)?;
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::AUTHORIZATION,
        codec::openai::bearer_value(ctx.api_key)?,
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(UpstreamRequestParts {
        method: http::Method::POST,
        url,
        headers,
        body: UpstreamRequestBody::Json(body),
    })
}

/// 候选选择：最高优先级的非空桶内做加权随机。
///
/// 权重全为零时桶内均匀随机；同权重候选之间的平局裁决任意
/// 但在单请求内稳定（tried 集合单调增长）。
#[must_use]
pub fn select_channel(
    candidates: &[Arc<ChannelMeta>],
    tried: &std::collections::HashSet<ChannelId>,
) -> Option<Arc<ChannelMeta>> {
    let available: Vec<&Arc<ChannelMeta>> = candidates
        .iter()
        .filter(|channel| !tried.contains(&channel.id))
        .collect();
    if available.is_empty() {
        return None;
    }

    let top_priority = available
        .iter()
        .map(|channel| channel.priority)
        .max()
        .expect("available 非空");
    let bucket: Vec<&Arc<ChannelMeta>> = available
        .into_iter()
        .filter(|channel| channel.priority == top_priority)
        .collect();

    let total_weight: i64 = bucket.iter().map(|channel| channel.weight.max(0)).sum();
    let mut rng = rand::thread_rng();
    if total_weight <= 0 {
        let index = rng.gen_range(0..bucket.len());
        return Some(Arc::clone(bucket[index]));
    }
    let mut roll = rng.gen_range(0..total_weight);
    for channel in &bucket {
        let weight = channel.weight.max(0);
        if roll < weight {
            return Some(Arc::clone(channel));
        }
        roll -= weight;
    }
    bucket.last().map(|channel| Arc::clone(channel))
}
