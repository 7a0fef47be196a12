//! 中继管道端到端测试
//!
//! 本地起一个假上游，覆盖：非流式直通、流式聚合计量、
//! 跨渠道重试、候选耗尽退款、透传头部卫生。

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use http::{HeaderMap, Request, StatusCode, header};
use sea_orm::{ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use migration::{Migrator, MigratorTrait};
use relay_gateway::app::AppState;
use relay_gateway::config::{AppConfig, DatabaseConfig, RelayConfig, ServerConfig};
use relay_gateway::relay::server::build_router;

const TOKEN_KEY: &str = "inttest";
const INITIAL_QUOTA: i64 = 1_000_000;

#[derive(Default)]
struct MockState {
    captured_headers: Mutex<Option<HeaderMap>>,
}

async fn mock_chat_ok() -> Response {
    let body = serde_json::json!({
        "id": "chatcmpl-upstream",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello from upstream"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13},
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn mock_chat_fail() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"error":{"message":"upstream exploded"}}"#.to_string(),
    )
        .into_response()
}

async fn mock_chat_stream() -> Response {
    let events = concat!(
        "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"A\"}}]}\n\n",
        "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"B\"}}]}\n\n",
        "data: {\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"C\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"object\":\"chat.completion.chunk\",\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":3,\"total_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/event-stream")],
        events.to_string(),
    )
        .into_response()
}

async fn mock_chat_echo_headers(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> Response {
    *state.captured_headers.lock().unwrap() = Some(headers);
    mock_chat_ok().await
}

/// 假上游：不同路径前缀模拟不同渠道行为
async fn spawn_mock_upstream() -> (String, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let router = Router::new()
        .route("/ok/chat/completions", post(mock_chat_ok))
        .route("/fail/chat/completions", post(mock_chat_fail))
        .route("/stream/chat/completions", post(mock_chat_stream))
        .route("/echo/chat/completions", post(mock_chat_echo_headers))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{address}"), state)
}

fn test_config() -> AppConfig {
    let mut relay = RelayConfig::default();
    relay.max_retries = 3;
    relay.retry_cooldown_seconds = 60;
    relay.log_buffer_size = 1;
    relay.log_flush_seconds = 1;
    AppConfig {
        server: ServerConfig::default(),
        database: DatabaseConfig::default(),
        relay,
    }
}

async fn seed_user_token(db: &DatabaseConnection) {
    let user = entity::users::Entity::insert(entity::users::ActiveModel {
        username: Set("it-user".to_string()),
        group: Set("default".to_string()),
        quota: Set(0),
        ..Default::default()
    })
    .exec_with_returning(db)
    .await
    .unwrap();

    entity::tokens::Entity::insert(entity::tokens::ActiveModel {
        user_id: Set(user.id),
        key: Set(TOKEN_KEY.to_string()),
        name: Set("integration".to_string()),
        quota: Set(INITIAL_QUOTA),
        ..Default::default()
    })
    .exec(db)
    .await
    .unwrap();
}

async fn seed_channel(
    db: &DatabaseConnection,
    name: &str,
    base_url: &str,
    priority: i64,
    pass_through: bool,
    header_override: Option<&str>,
) {
    entity::channels::Entity::insert(entity::channels::ActiveModel {
        name: Set(name.to_string()),
        family: Set("openai".to_string()),
        base_url: Set(base_url.to_string()),
        key: Set("sk-upstream".to_string()),
        status: Set(entity::channels::CHANNEL_STATUS_ENABLED),
        priority: Set(priority),
        weight: Set(1),
        models: Set("gpt-4o-mini".to_string()),
        groups: Set("default".to_string()),
        pass_through: Set(pass_through),
        header_override: Set(header_override.map(str::to_string)),
        ..Default::default()
    })
    .exec(db)
    .await
    .unwrap();
}

async fn build_app(db: DatabaseConnection) -> Arc<AppState> {
    let (state, _tasks) = AppState::build(test_config(), db).await.unwrap();
    state
}

fn chat_request(stream: bool) -> Request<Body> {
    let body = serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer sk-{TOKEN_KEY}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn token_quota(db: &DatabaseConnection) -> i64 {
    entity::tokens::Entity::find()
        .filter(entity::tokens::Column::Key.eq(TOKEN_KEY))
        .one(db)
        .await
        .unwrap()
        .unwrap()
        .quota
}

/// 日志经异步写入任务落库，轮询等待
async fn wait_for_log(db: &DatabaseConnection) -> entity::log_records::Model {
    for _ in 0..50 {
        if let Some(record) = entity::log_records::Entity::find()
            .one(db)
            .await
            .unwrap()
        {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("日志记录未在预期时间内落库");
}

async fn body_string(response: Response) -> String {
    let bytes: Bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn setup(channels: &[(&str, &str, i64)]) -> (Arc<AppState>, DatabaseConnection, String) {
    let (base, _mock) = spawn_mock_upstream().await;
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    seed_user_token(&db).await;
    for (name, path, priority) in channels {
        seed_channel(&db, name, &format!("{base}{path}"), *priority, false, None).await;
    }
    let state = build_app(db.clone()).await;
    (state, db, base)
}

#[tokio::test]
async fn buffered_chat_relays_and_settles() {
    let (state, db, _base) = setup(&[("primary", "/ok", 0)]).await;
    let router = build_router(state);

    let response = router.oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    // 同线格式逐字节透传
    assert!(body.contains("hello from upstream"));
    assert!(body.contains("\"total_tokens\":13"));

    let record = wait_for_log(&db).await;
    assert_eq!(record.status, "ok");
    assert_eq!(record.prompt_tokens, 9);
    assert_eq!(record.completion_tokens, 4);
    assert_eq!(record.total_tokens, 13);
    assert!(record.quota_cost > 0);
    assert!(!record.is_stream);

    // 配额守恒：扣减 = 结算成本
    assert_eq!(INITIAL_QUOTA - token_quota(&db).await, record.quota_cost);
}

#[tokio::test]
async fn streaming_chat_aggregates_usage_and_payload() {
    let (state, db, _base) = setup(&[("stream", "/stream", 0)]).await;
    let router = build_router(state);

    let response = router.oneshot(chat_request(true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
    let body = body_string(response).await;

    // 客户端按上游顺序收到三个增量与结束哨兵
    let a = body.find("\"content\":\"A\"").unwrap();
    let b = body.find("\"content\":\"B\"").unwrap();
    let c = body.find("\"content\":\"C\"").unwrap();
    assert!(a < b && b < c);
    assert!(body.contains("[DONE]"));

    let record = wait_for_log(&db).await;
    assert_eq!(record.status, "ok");
    assert!(record.is_stream);
    assert_eq!(record.prompt_tokens, 1);
    assert_eq!(record.completion_tokens, 3);
    assert_eq!(record.total_tokens, 4);
    assert_eq!(record.usage_source, "reconciled");
    assert!(record.first_byte_ms.is_some());

    // 载荷捕获：完整响应为各事件 data 的串联（不含 [DONE]）
    let detail = entity::log_details::Entity::find()
        .filter(entity::log_details::Column::RecordId.eq(record.id))
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    let full = detail.response_full.unwrap();
    assert!(full.contains("\"content\":\"A\""));
    assert!(full.contains("\"usage\""));
    assert!(!full.contains("[DONE]"));

    assert_eq!(INITIAL_QUOTA - token_quota(&db).await, record.quota_cost);
}

#[tokio::test]
async fn retry_moves_to_next_channel_and_keeps_first_channel_id() {
    let (state, db, _base) = setup(&[("broken", "/fail", 10), ("backup", "/ok", 0)]).await;
    let router = build_router(state);

    let response = router.oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let record = wait_for_log(&db).await;
    assert_eq!(record.status, "ok");
    assert_eq!(record.retry_count, 1);
    // 首次尝试的渠道保留在日志里，成功渠道是另一个
    assert_ne!(record.first_channel_id, record.channel_id);

    // 失败渠道进入 (渠道, 模型) 冷却
    let broken_id = entity::channels::Entity::find()
        .filter(entity::channels::Column::Name.eq("broken"))
        .one(&db)
        .await
        .unwrap()
        .unwrap()
        .id;
    assert_eq!(record.first_channel_id, Some(broken_id));

    // 配额只扣一次
    assert_eq!(INITIAL_QUOTA - token_quota(&db).await, record.quota_cost);
}

#[tokio::test]
async fn exhausted_candidates_return_503_and_refund() {
    let (state, db, _base) = setup(&[("f1", "/fail", 10), ("f2", "/fail", 0)]).await;
    let router = build_router(state);

    let response = router.oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_string(response).await;
    // 客户端只看到归一化错误，上游错误体不透出
    assert!(!body.contains("upstream exploded"));

    let record = wait_for_log(&db).await;
    assert_eq!(record.status, "no_channel");
    assert_eq!(record.quota_cost, 0);

    // 预扣全额退款
    assert_eq!(token_quota(&db).await, INITIAL_QUOTA);
}

#[tokio::test]
async fn unknown_model_yields_no_channel() {
    let (state, db, _base) = setup(&[("primary", "/ok", 0)]).await;
    let router = build_router(state);

    let body = serde_json::json!({
        "model": "not-served-anywhere",
        "messages": [{"role": "user", "content": "hi"}],
    });
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer sk-{TOKEN_KEY}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(token_quota(&db).await, INITIAL_QUOTA);
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let (state, _db, _base) = setup(&[("primary", "/ok", 0)]).await;
    let router = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn pass_through_strips_hop_by_hop_and_applies_override() {
    let (base, mock) = spawn_mock_upstream().await;
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    seed_user_token(&db).await;
    seed_channel(
        &db,
        "echo",
        &format!("{base}/echo"),
        0,
        true,
        Some(r#"{"X-Upstream-Trace": "{client_header:X-Trace-Id}"}"#),
    )
    .await;
    let state = build_app(db.clone()).await;
    let router = build_router(state);

    let body = serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
    });
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer sk-{TOKEN_KEY}"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, "s=1")
        .header(header::CONNECTION, "X-Hop, keep-alive")
        .header("x-hop", "1")
        .header("x-trace-id", "t")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen = mock
        .captured_headers
        .lock()
        .unwrap()
        .clone()
        .expect("假上游应当收到请求");
    // 渠道凭证替换了客户端凭证
    assert_eq!(
        seen.get(header::AUTHORIZATION).unwrap(),
        "Bearer sk-upstream"
    );
    assert!(seen.get(header::COOKIE).is_none());
    assert!(seen.get("x-hop").is_none());
    assert!(seen.get("keep-alive").is_none());
    // 普通头透传，覆盖模板生效
    assert_eq!(seen.get("x-trace-id").unwrap(), "t");
    assert_eq!(seen.get("x-upstream-trace").unwrap(), "t");
}
