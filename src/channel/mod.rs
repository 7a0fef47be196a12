//! # 渠道模块
//!
//! 渠道注册表的内存快照与 (渠道, 模型) 冷却表

pub mod cooldown;
pub mod registry;

pub use cooldown::CooldownMap;
pub use registry::{ChannelMeta, ChannelRegistry};
