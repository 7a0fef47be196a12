//! # 鉴权模块
//!
//! 网关令牌的解析与校验：令牌启用且未过期、所属用户启用、
//! 模型白名单命中，方可进入中继管道。

mod service;

pub use service::{AuthContext, AuthService, extract_bearer_key};
