//! 网关错误类型定义
//!
//! 按协议边界错误码组织，区分协议错误（连接保持打开）与致命错误（连接关闭）

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthError;

/// 协议边界错误码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// 报文无法解析或类型未知
    InvalidMessage,
    /// 未认证的访问
    Unauthorized,
    /// 无权访问的频道
    Forbidden,
    /// 无效的频道名
    InvalidChannel,
    /// 超过单连接频道上限
    TooManyChannels,
    /// 触发限流
    RateLimitExceeded,
    /// 报文超过大小上限
    MessageTooLarge,
    /// 服务器内部错误
    ServerError,
    /// 依赖不可用（代理/存储）
    ServiceUnavailable,
}

/// 网关错误类型
#[derive(Debug, Error)]
pub enum GatewayError {
    /// 报文解析失败或类型未知
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// 未认证
    #[error("not authenticated")]
    Unauthorized,

    /// 频道无权限
    #[error("channel not permitted: {0}")]
    Forbidden(String),

    /// 频道名非法
    #[error("invalid channel name: {0}")]
    InvalidChannel(String),

    /// 超过频道订阅上限
    #[error("too many channels (max {max})")]
    TooManyChannels { max: usize },

    /// 限流拒绝
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// 报文过大
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// 认证失败
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// 依赖不可用
    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    /// 其他内部错误
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// 映射为协议边界错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            GatewayError::Unauthorized | GatewayError::Auth(_) => ErrorCode::Unauthorized,
            GatewayError::Forbidden(_) => ErrorCode::Forbidden,
            GatewayError::InvalidChannel(_) => ErrorCode::InvalidChannel,
            GatewayError::TooManyChannels { .. } => ErrorCode::TooManyChannels,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            GatewayError::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            GatewayError::Unavailable(_) => ErrorCode::ServiceUnavailable,
            GatewayError::Internal(_) => ErrorCode::ServerError,
        }
    }

    /// 该错误是否只影响当前请求（连接保持打开）
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, GatewayError::Internal(_))
    }
}

/// 网关结果类型
pub type Result<T> = std::result::Result<T, GatewayError>;
