//! # 中继管道
//!
//! 从已鉴权的入站请求到完成计量与落日志的响应的全路径：
//! 方言编解码、上游传输、流量搬运、用量对账与载荷捕获。

pub mod capture;
pub mod codec;
pub mod context;
pub mod controller;
pub mod handlers;
pub mod server;
pub mod transport;
pub mod usage;

pub use context::{InboundPayload, RelayInfo};
