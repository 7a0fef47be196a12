//! # 公共类型别名
//!
//! 管道各层共享的标识与计量类型

/// 渠道标识
pub type ChannelId = i32;
/// 用户标识
pub type UserId = i32;
/// 令牌标识
pub type TokenId = i32;
/// 配额金额（quota 单位，500_000 = 1 USD）
pub type QuotaAmount = i64;
/// Token 计数
pub type TokenCount = u32;

/// 1 美元对应的配额单位
pub const QUOTA_PER_USD: f64 = 500_000.0;
