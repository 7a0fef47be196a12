#![allow(missing_docs)]
//! # AI API 网关中继核心库
//!
//! 多租户反向代理：统一 OpenAI 兼容入口，渠道调度与重试、
//! 方言双向转换、流式聚合计量、配额三段式记账与审计日志。

pub mod app;
pub mod auth;
pub mod channel;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod logs;
pub mod pricing;
pub mod relay;
pub mod types;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{RelayError, Result};
