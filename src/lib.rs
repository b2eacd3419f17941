//! Pulse Gateway 实时通知网关
//!
//! 多实例 WebSocket 通知投递：连接生命周期、JWT 认证、频道订阅、
//! 共享会话存储、跨实例事件路由、送达确认与限流。

pub mod ack;
pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod offline;
pub mod protocol;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod server;
pub mod session;
pub mod subscription;

pub use config::GatewayConfig;
pub use error::{ErrorCode, GatewayError, Result};
pub use protocol::{Envelope, Notification, Priority};
pub use server::GatewayServer;
