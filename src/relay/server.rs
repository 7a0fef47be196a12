//! # 中继服务器
//!
//! OpenAI 兼容超集的路由装配与服务入口

use axum::Router;
use axum::routing::post;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::app::AppState;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::linfo;

use super::handlers;

/// 装配入站路由
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/images/generations", post(handlers::images_generations))
        .route(
            "/v1/audio/transcriptions",
            post(handlers::audio_transcriptions),
        )
        .route(
            "/v1/audio/translations",
            post(handlers::audio_translations),
        )
        .route("/v1/audio/speech", post(handlers::audio_speech))
        .route("/v1/responses", post(handlers::responses))
        .route("/v1/messages", post(handlers::claude_messages))
        .route(
            "/v1beta/models/{model_action}",
            post(handlers::gemini_generate),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 绑定监听地址并开始服务；关停令牌触发后优雅退出
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let address = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| RelayError::internal_with_source(format!("监听 {address} 失败"), e))?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "listening",
        "中继服务器开始监听",
        address = %address
    );

    let shutdown = state.shutdown.clone();
    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| RelayError::internal_with_source("服务器异常退出", e))
}
