//! # 中继控制器
//!
//! 鉴权上下文 -> 预扣 -> 调度 -> 编解码 -> 流量搬运 -> 对账 ->
//! 结算 -> 落日志。流式路径由独立任务读上游事件，经有界通道
//! 推给客户端写端，客户端慢时自然背压。

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderValue, StatusCode, header};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::app::AppState;
use crate::auth::AuthService;
use crate::channel::ChannelMeta;
use crate::error::{RelayError, Result, render_error_body};
use crate::ledger::PreCharge;
use crate::logging::{LogComponent, LogStage};
use crate::logs::LogEntry;
use crate::relay::capture::PayloadCapture;
use crate::relay::codec::canonical::{CanonicalResponse, StreamAggregator};
use crate::relay::codec::sse::{SseEvent, SseParser, format_event};
use crate::relay::codec::{
    self, ApiDialect, ClientEmitter, StreamDecoder, upstream_parse_response,
    upstream_stream_decoder,
};
use crate::relay::context::{InboundPayload, RelayInfo};
use crate::relay::transport::{UpstreamBody, UpstreamReply};
use crate::relay::usage::{
    self, Usage, UsageSource, estimate_completion_tokens, estimate_text_tokens,
};
use crate::{ldebug, linfo, lwarn};

/// 请求级主入口：成功返回客户端响应，失败统一走退款与日志
pub async fn relay(state: Arc<AppState>, mut info: RelayInfo, payload: InboundPayload) -> Response {
    let mut pre_charge: Option<PreCharge> = None;
    let result = relay_inner(&state, &mut info, &payload, &mut pre_charge).await;
    match result {
        Ok(response) => response,
        Err(err) => fail_request(&state, info, pre_charge, err).await,
    }
}

async fn relay_inner(
    state: &Arc<AppState>,
    info: &mut RelayInfo,
    payload: &InboundPayload,
    pre_charge_slot: &mut Option<PreCharge>,
) -> Result<Response> {
    AuthService::check_model_allowed(&info.auth, &info.requested_model)?;

    // 预扣估算：输入按规范形估 token，输出按客户端上限或兜底
    let (prompt_estimate, output_hint) = match payload {
        InboundPayload::Chat(request) => (
            usage::estimate_prompt_tokens(request),
            request
                .max_output_tokens
                .unwrap_or(state.config.relay.max_output_tokens_default),
        ),
        InboundPayload::Json(body) => (estimate_text_tokens(&body.to_string()), 0),
        InboundPayload::Binary { bytes, .. } => {
            (u32::try_from(bytes.len() / 4).unwrap_or(u32::MAX), 0)
        }
    };
    info.prompt_tokens_estimate = prompt_estimate;

    let estimated = state.pricing.estimate_pre_charge(
        &info.requested_model,
        prompt_estimate,
        output_hint,
    );
    let pre_charge = state
        .ledger
        .pre_charge(&info.auth.token, &info.auth.user, estimated)
        .await?;
    *pre_charge_slot = Some(pre_charge);
    ldebug!(
        &info.request_id,
        LogStage::RequestStart,
        LogComponent::Relay,
        "pre_charged",
        "配额预扣完成",
        amount = estimated,
        prompt_estimate = prompt_estimate
    );

    let cancel = CancellationToken::new();
    let outcome = state.dispatcher.dispatch(info, payload, &cancel).await?;

    if outcome.reply.is_stream {
        let placeholder = placeholder_info(info);
        let owned_info = std::mem::replace(info, placeholder);
        Ok(start_streaming(
            Arc::clone(state),
            owned_info,
            pre_charge,
            outcome.channel,
            outcome.reply,
        ))
    } else {
        finish_buffered(state, info, pre_charge, &outcome.channel, outcome.reply).await
    }
}

/// 流式路径把 `RelayInfo` 移交给搬运任务；原位置留一个壳，
/// 外层错误路径不会再使用它。
fn placeholder_info(info: &RelayInfo) -> RelayInfo {
    RelayInfo::new(
        info.dialect,
        info.requested_model.clone(),
        info.is_stream,
        info.auth.clone(),
        http::HeaderMap::new(),
        info.client_ip.clone(),
        std::time::Duration::from_secs(1),
    )
}

// ---------------- 缓冲路径 ----------------

async fn finish_buffered(
    state: &Arc<AppState>,
    info: &mut RelayInfo,
    pre_charge: PreCharge,
    channel: &Arc<ChannelMeta>,
    reply: UpstreamReply,
) -> Result<Response> {
    let UpstreamBody::Buffered(bytes) = reply.body else {
        return Err(RelayError::internal("缓冲路径收到流式响应体"));
    };
    info.mark_first_byte();
    info.response_capture.capture_bytes(&bytes);

    let passthrough = info.dialect.same_wire(channel.family);
    let (client_bytes, reported, computed_completion) = if info.dialect.is_chat_like() {
        let mut canonical = upstream_parse_response(
            channel.family,
            info.dialect,
            &bytes,
            &info.requested_model,
        )?;
        let reported = canonical.usage;
        let completion = estimate_completion_tokens(&canonical);
        if passthrough {
            (bytes.clone(), reported, completion)
        } else {
            // 客户端看到的是自己请求的模型名
            canonical.model = info.requested_model.clone();
            let body = codec::render_response(info.dialect, &canonical, &info.request_id)?;
            (Bytes::from(body.to_string()), reported, completion)
        }
    } else {
        // 非聊天方言逐字节透传，仅提取用量
        let reported = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|value| codec::openai::parse_usage(value.get("usage")));
        (bytes.clone(), reported, 0)
    };

    let computed = Usage {
        prompt_tokens: info.prompt_tokens_estimate,
        completion_tokens: computed_completion,
        ..Usage::default()
    };
    let (final_usage, source) = usage::reconcile(&info.request_id, reported, computed);

    let actual_cost = state
        .pricing
        .settle_cost(&info.requested_model, &final_usage);
    state
        .ledger
        .settle(&info.request_id, &pre_charge, actual_cost)
        .await?;

    submit_log(
        state,
        info,
        Some(channel.id),
        final_usage,
        source,
        actual_cost,
        "ok",
    );
    linfo!(
        &info.request_id,
        LogStage::Response,
        LogComponent::Relay,
        "relay_ok",
        "请求完成",
        channel_id = channel.id,
        total_tokens = final_usage.total_tokens,
        quota_cost = actual_cost
    );

    let content_type = reply
        .headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    Response::builder()
        .status(reply.status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(client_bytes))
        .map_err(|e| RelayError::internal_with_source("响应构造失败", e))
}

// ---------------- 流式路径 ----------------

fn start_streaming(
    state: Arc<AppState>,
    info: RelayInfo,
    pre_charge: PreCharge,
    channel: Arc<ChannelMeta>,
    reply: UpstreamReply,
) -> Response {
    let capacity = state.config.relay.stream_buffer_events;
    let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(capacity);

    tokio::spawn(pump_stream(state, info, pre_charge, channel, reply, tx));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// 流搬运任务的收尾状态
struct StreamEnd {
    client_gone: bool,
    upstream_failed: bool,
    delivered_any: bool,
}

async fn pump_stream(
    state: Arc<AppState>,
    mut info: RelayInfo,
    pre_charge: PreCharge,
    channel: Arc<ChannelMeta>,
    reply: UpstreamReply,
    tx: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
) {
    let UpstreamBody::Stream(mut stream) = reply.body else {
        lwarn!(
            &info.request_id,
            LogStage::Response,
            LogComponent::Relay,
            "stream_shape_mismatch",
            "流式路径收到缓冲响应体"
        );
        return;
    };

    let passthrough = info.dialect.same_wire(channel.family);
    let mut parser = SseParser::new();
    let mut decoder = upstream_stream_decoder(channel.family, info.dialect);
    let mut aggregator = StreamAggregator::new();
    let mut emitter: Option<Box<dyn ClientEmitter>> = if passthrough {
        None
    } else {
        codec::emitter_for(info.dialect, &info.requested_model, &info.request_id).ok()
    };

    let mut end = StreamEnd {
        client_gone: false,
        upstream_failed: false,
        delivered_any: false,
    };

    'outer: loop {
        let remaining = info.remaining();
        if remaining.is_zero() {
            end.upstream_failed = true;
            break;
        }
        match tokio::time::timeout(remaining, stream.next()).await {
            Err(_) => {
                end.upstream_failed = true;
                info.last_upstream_error = Some("流式读取超过请求截止时间".to_string());
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                end.upstream_failed = true;
                info.last_upstream_error = Some(err.to_string());
                break;
            }
            Ok(Some(Ok(chunk))) => {
                info.mark_first_byte();
                let text = String::from_utf8_lossy(&chunk);
                for event in parser.feed(&text) {
                    if !handle_event(
                        &event,
                        &mut info,
                        decoder.as_mut(),
                        &mut aggregator,
                        &mut emitter,
                        passthrough,
                        &tx,
                        &mut end,
                    )
                    .await
                    {
                        break 'outer;
                    }
                }
            }
        }
    }

    // 缓冲区残留与解码器收尾
    if !end.client_gone {
        if let Some(event) = parser.finish() {
            let _ = handle_event(
                &event,
                &mut info,
                decoder.as_mut(),
                &mut aggregator,
                &mut emitter,
                passthrough,
                &tx,
                &mut end,
            )
            .await;
        }
    }
    if let Ok(deltas) = decoder.finish() {
        for delta in &deltas {
            aggregator.apply(delta);
        }
        if !end.client_gone {
            if let Some(emitter) = emitter.as_deref_mut() {
                for delta in &deltas {
                    for frame in emitter.emit(delta) {
                        if send_frame(&tx, frame, &mut end).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    let canonical = aggregator.finish(&info.requested_model);

    // 翻译模式下补齐客户端方言的结束帧
    if !end.client_gone && !end.upstream_failed {
        if let Some(emitter) = emitter.as_deref_mut() {
            for frame in emitter.finish(&canonical) {
                if send_frame(&tx, frame, &mut end).await.is_err() {
                    break;
                }
            }
        }
    }
    drop(tx);

    finalize_stream(&state, &mut info, &pre_charge, &channel, canonical, end).await;
}

/// 处理一个上游事件；返回 false 表示客户端已断开
#[allow(clippy::too_many_arguments)]
async fn handle_event(
    event: &SseEvent,
    info: &mut RelayInfo,
    decoder: &mut dyn StreamDecoder,
    aggregator: &mut StreamAggregator,
    emitter: &mut Option<Box<dyn ClientEmitter>>,
    passthrough: bool,
    tx: &mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
    end: &mut StreamEnd,
) -> bool {
    let mut emitter = emitter.as_deref_mut();
    info.response_capture.append_chunk(&event.data);

    let deltas = match decoder.decode(event) {
        Ok(deltas) => deltas,
        Err(err) => {
            ldebug!(
                &info.request_id,
                LogStage::Codec,
                LogComponent::Codec,
                "stream_event_undecodable",
                "流事件解码失败，按原样转发",
                error = %err
            );
            Vec::new()
        }
    };
    for delta in &deltas {
        aggregator.apply(delta);
    }

    if passthrough {
        let frame = format_event(event.event.as_deref(), &event.data);
        if send_frame(tx, frame, end).await.is_err() {
            return false;
        }
    } else if let Some(emitter) = emitter.as_deref_mut() {
        for delta in &deltas {
            for frame in emitter.emit(delta) {
                if send_frame(tx, frame, end).await.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

async fn send_frame(
    tx: &mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
    frame: String,
    end: &mut StreamEnd,
) -> std::result::Result<(), ()> {
    match tx.send(Ok(Bytes::from(frame))).await {
        Ok(()) => {
            end.delivered_any = true;
            Ok(())
        }
        Err(_) => {
            end.client_gone = true;
            Err(())
        }
    }
}

/// 流尾收口：对账、结算（或退款）、落日志
async fn finalize_stream(
    state: &Arc<AppState>,
    info: &mut RelayInfo,
    pre_charge: &PreCharge,
    channel: &Arc<ChannelMeta>,
    canonical: CanonicalResponse,
    end: StreamEnd,
) {
    let reported = canonical.usage;
    let computed = Usage {
        prompt_tokens: info.prompt_tokens_estimate,
        completion_tokens: estimate_completion_tokens(&canonical),
        ..Usage::default()
    };

    let partial = end.client_gone || end.upstream_failed;
    let (final_usage, source) = if partial && !state.config.relay.debit_partial_stream_in_full {
        // 可配置策略：部分交付只按已交付内容计费
        let mut usage = computed;
        usage.normalize();
        (usage, UsageSource::Computed)
    } else {
        usage::reconcile(&info.request_id, reported, computed)
    };

    let status = if !partial {
        "ok"
    } else if end.delivered_any {
        "partially_delivered"
    } else if end.client_gone {
        "client_cancelled"
    } else {
        "channel_retryable"
    };

    let mut quota_cost = 0;
    if end.client_gone && !end.delivered_any {
        // 一个字节都没交付：按整单失败退款
        if let Err(err) = state.ledger.refund(&info.request_id, pre_charge).await {
            lwarn!(
                &info.request_id,
                LogStage::Internal,
                LogComponent::Ledger,
                "refund_failed",
                "流式退款失败",
                error = %err
            );
        }
    } else {
        let actual_cost = state
            .pricing
            .settle_cost(&info.requested_model, &final_usage);
        quota_cost = actual_cost;
        if let Err(err) = state
            .ledger
            .settle(&info.request_id, pre_charge, actual_cost)
            .await
        {
            lwarn!(
                &info.request_id,
                LogStage::Internal,
                LogComponent::Ledger,
                "settle_failed",
                "流式结算失败",
                error = %err
            );
        }
    }

    submit_log(
        state,
        info,
        Some(channel.id),
        final_usage,
        source,
        quota_cost,
        status,
    );
    linfo!(
        &info.request_id,
        LogStage::Response,
        LogComponent::Relay,
        "stream_finished",
        "流式请求收口",
        channel_id = channel.id,
        status = status,
        total_tokens = final_usage.total_tokens,
        quota_cost = quota_cost
    );
}

// ---------------- 失败路径与日志 ----------------

/// 整单失败：按错误类别退款、落日志、按方言渲染错误体
async fn fail_request(
    state: &Arc<AppState>,
    info: RelayInfo,
    pre_charge: Option<PreCharge>,
    err: RelayError,
) -> Response {
    if let Some(pre_charge) = pre_charge {
        if err.refunds_pre_charge() {
            if let Err(refund_err) = state.ledger.refund(&info.request_id, &pre_charge).await {
                lwarn!(
                    &info.request_id,
                    LogStage::Internal,
                    LogComponent::Ledger,
                    "refund_failed",
                    "失败请求退款失败",
                    error = %refund_err
                );
            }
        }
    }

    lwarn!(
        &info.request_id,
        LogStage::Error,
        LogComponent::Relay,
        "relay_failed",
        "请求失败",
        status = err.log_status(),
        error = %err
    );
    let channel_id = info.channel.as_ref().map(|channel| channel.id);
    submit_log(
        state,
        &info,
        channel_id,
        Usage::default(),
        UsageSource::Computed,
        0,
        err.log_status(),
    );

    error_response(&err, info.dialect)
}

/// 按客户端方言渲染错误响应
#[must_use]
pub fn error_response(err: &RelayError, dialect: ApiDialect) -> Response {
    let body = render_error_body(err, dialect);
    Response::builder()
        .status(err.status_code())
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn submit_log(
    state: &Arc<AppState>,
    info: &RelayInfo,
    channel_id: Option<i32>,
    usage: Usage,
    source: UsageSource,
    quota_cost: i64,
    status: &str,
) {
    let (request_preview, request_full) = capture_parts(&info.request_capture);
    let (response_preview, response_full) = capture_parts(&info.response_capture);
    state.logs.submit(LogEntry {
        request_id: info.request_id.clone(),
        user_id: info.auth.user.id,
        token_id: info.auth.token.id,
        channel_id,
        first_channel_id: info.first_channel_id,
        model: info.requested_model.clone(),
        dialect: info.dialect.as_str().to_string(),
        is_stream: info.is_stream,
        usage,
        usage_source: source,
        quota_cost,
        status: status.to_string(),
        latency_ms: info.latency_ms(),
        first_byte_ms: info.first_byte_ms(),
        retry_count: info.attempts.saturating_sub(1) as i32,
        client_ip: info.client_ip.clone(),
        request_preview,
        request_full,
        response_preview,
        response_full,
        upstream_error: info.last_upstream_error.clone(),
    });
}

fn capture_parts(capture: &PayloadCapture) -> (Option<String>, Option<String>) {
    (capture.preview(), capture.full_payload())
}
