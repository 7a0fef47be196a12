//! # 错误处理模块
//!
//! 管道统一的错误类别定义与分类

mod render;
mod types;

pub use render::render_error_body;
pub use types::{RelayError, RetryClass};

/// 应用结果类型
pub type Result<T> = std::result::Result<T, RelayError>;
