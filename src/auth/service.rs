//! # 鉴权服务

use chrono::Utc;
use http::HeaderMap;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use entity::{tokens, users};

use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::ldebug;

/// 已通过鉴权的请求上下文
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token: tokens::Model,
    pub user: users::Model,
    /// 令牌可见的渠道分组
    pub groups: Vec<String>,
}

/// 鉴权服务
pub struct AuthService {
    db: DatabaseConnection,
}

/// 从请求头或查询参数提取密钥体。
///
/// 依次尝试 `Authorization: Bearer sk-…`、`x-api-key`（Claude
/// 原生端点）与 `key` 查询参数（Gemini 原生端点）。
#[must_use]
pub fn extract_bearer_key(headers: &HeaderMap, query_key: Option<&str>) -> Option<String> {
    let from_auth = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    let from_api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim);

    from_auth
        .or(from_api_key)
        .or(query_key)
        .map(|key| key.strip_prefix("sk-").unwrap_or(key).to_string())
        .filter(|key| !key.is_empty())
}

impl AuthService {
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// 校验令牌并装配鉴权上下文
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query_key: Option<&str>,
        request_id: &str,
    ) -> Result<AuthContext> {
        let key = extract_bearer_key(headers, query_key)
            .ok_or_else(|| RelayError::unauthorized("missing api key"))?;

        let token = tokens::Entity::find()
            .filter(tokens::Column::Key.eq(key))
            .one(&self.db)
            .await?
            .ok_or_else(|| RelayError::unauthorized("invalid api key"))?;

        if !token.is_enabled() {
            return Err(RelayError::unauthorized("api key disabled"));
        }
        if let Some(expired_at) = token.expired_at {
            if expired_at > 0 && expired_at <= Utc::now().timestamp() {
                return Err(RelayError::unauthorized("api key expired"));
            }
        }

        let user = users::Entity::find_by_id(token.user_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| RelayError::unauthorized("user not found"))?;
        if !user.is_enabled() {
            return Err(RelayError::unauthorized("user disabled"));
        }

        let groups = token.allowed_groups();
        ldebug!(
            request_id,
            LogStage::Authentication,
            LogComponent::Auth,
            "authenticated",
            "令牌校验通过",
            token_id = token.id,
            user_id = user.id
        );
        Ok(AuthContext {
            token,
            user,
            groups,
        })
    }

    /// 模型白名单检查；空白名单表示不限制
    pub fn check_model_allowed(ctx: &AuthContext, model: &str) -> Result<()> {
        let allowed = ctx.token.allowed_models();
        if allowed.is_empty() || allowed.iter().any(|name| name == model) {
            Ok(())
        } else {
            Err(RelayError::ForbiddenModel {
                model: model.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{Database, Set};

    async fn setup(expired_at: Option<i64>, token_status: i32, user_status: i32) -> AuthService {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        let user = users::Entity::insert(users::ActiveModel {
            username: Set("alice".to_string()),
            group: Set("default".to_string()),
            quota: Set(1000),
            status: Set(user_status),
            ..Default::default()
        })
        .exec_with_returning(&db)
        .await
        .unwrap();

        tokens::Entity::insert(tokens::ActiveModel {
            user_id: Set(user.id),
            key: Set("abc123".to_string()),
            name: Set("t".to_string()),
            status: Set(token_status),
            quota: Set(1000),
            models: Set(Some("gpt-4o-mini".to_string())),
            expired_at: Set(expired_at),
            ..Default::default()
        })
        .exec(&db)
        .await
        .unwrap();

        AuthService::new(db)
    }

    fn bearer(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {key}")).unwrap(),
        );
        headers
    }

    #[test]
    fn key_extraction_strips_prefix_and_tries_fallbacks() {
        assert_eq!(
            extract_bearer_key(&bearer("sk-abc123"), None).as_deref(),
            Some("abc123")
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-xyz"));
        assert_eq!(extract_bearer_key(&headers, None).as_deref(), Some("xyz"));

        assert_eq!(
            extract_bearer_key(&HeaderMap::new(), Some("sk-qqq")).as_deref(),
            Some("qqq")
        );
        assert!(extract_bearer_key(&HeaderMap::new(), None).is_none());
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let auth = setup(None, tokens::TOKEN_STATUS_ENABLED, 1).await;
        let ctx = auth
            .authenticate(&bearer("sk-abc123"), None, "req-1")
            .await
            .unwrap();
        assert_eq!(ctx.user.username, "alice");
        assert_eq!(ctx.groups, vec!["default"]);
    }

    #[tokio::test]
    async fn unknown_or_disabled_token_rejected() {
        let auth = setup(None, tokens::TOKEN_STATUS_DISABLED, 1).await;
        let err = auth
            .authenticate(&bearer("sk-missing"), None, "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized { .. }));

        let err = auth
            .authenticate(&bearer("sk-abc123"), None, "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn expired_token_rejected() {
        let auth = setup(Some(1), tokens::TOKEN_STATUS_ENABLED, 1).await;
        let err = auth
            .authenticate(&bearer("sk-abc123"), None, "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn disabled_user_rejected() {
        let auth = setup(None, tokens::TOKEN_STATUS_ENABLED, 2).await;
        let err = auth
            .authenticate(&bearer("sk-abc123"), None, "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn model_allowlist_enforced() {
        let auth = setup(None, tokens::TOKEN_STATUS_ENABLED, 1).await;
        let ctx = auth
            .authenticate(&bearer("sk-abc123"), None, "req-1")
            .await
            .unwrap();
        assert!(AuthService::check_model_allowed(&ctx, "gpt-4o-mini").is_ok());
        assert!(matches!(
            AuthService::check_model_allowed(&ctx, "gpt-4o"),
            Err(RelayError::ForbiddenModel { .. })
        ));
    }
}
