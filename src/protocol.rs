//! 通知网关线上协议
//!
//! 双向报文统一信封 `{type, id, timestamp?, payload?}`，payload 为各类型专属对象。
//! `notification` 报文的信封 id 即通知 ID，客户端以该 id 回 `ack`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::AuthErrorCode;
use crate::error::{ErrorCode, GatewayError, Result};

/// 单条报文大小上限（10KB）
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024;

/// 报文信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// 报文类型
    #[serde(rename = "type")]
    pub kind: String,
    /// 报文 ID（notification 报文中即通知 ID）
    pub id: String,
    /// 发送时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// 类型专属负载
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// 构建服务端报文（自动生成 ID 与时间戳）
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            id: Uuid::new_v4().to_string(),
            timestamp: Some(Utc::now()),
            payload: Some(payload),
        }
    }

    /// 构建指定 ID 的服务端报文
    pub fn with_id(kind: &str, id: String, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            id,
            timestamp: Some(Utc::now()),
            payload: Some(payload),
        }
    }

    /// 解析入站报文，先做大小校验再做格式校验
    pub fn decode(raw: &str, max_bytes: usize) -> Result<Self> {
        if raw.len() > max_bytes {
            return Err(GatewayError::MessageTooLarge {
                size: raw.len(),
                max: max_bytes,
            });
        }
        serde_json::from_str(raw).map_err(|e| GatewayError::InvalidMessage(e.to_string()))
    }

    /// 序列化为传输帧
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// 解出客户端指令
    pub fn client_command(&self) -> Result<ClientCommand> {
        let payload = self.payload.clone().unwrap_or(Value::Null);
        let parse = |payload: Value| -> std::result::Result<ClientCommand, serde_json::Error> {
            match self.kind.as_str() {
                "auth" => serde_json::from_value::<AuthPayload>(payload)
                    .map(|p| ClientCommand::Auth { token: p.token }),
                "subscribe" => serde_json::from_value::<ChannelsPayload>(payload)
                    .map(|p| ClientCommand::Subscribe { channels: p.channels }),
                "unsubscribe" => serde_json::from_value::<ChannelsPayload>(payload)
                    .map(|p| ClientCommand::Unsubscribe { channels: p.channels }),
                "ack" => serde_json::from_value::<AckPayload>(payload).map(|p| ClientCommand::Ack {
                    notification_id: p.notification_id,
                    received_at: p.received_at,
                }),
                "ping" => Ok(ClientCommand::Ping),
                other => Err(serde::de::Error::custom(format!(
                    "unknown message type: {}",
                    other
                ))),
            }
        };
        parse(payload).map_err(|e| GatewayError::InvalidMessage(e.to_string()))
    }
}

/// 客户端指令
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Auth { token: String },
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Ack {
        notification_id: String,
        received_at: Option<DateTime<Utc>>,
    },
    Ping,
}

impl ClientCommand {
    /// 指令类型名（限流按类型分桶）
    pub fn kind(&self) -> &'static str {
        match self {
            ClientCommand::Auth { .. } => "auth",
            ClientCommand::Subscribe { .. } => "subscribe",
            ClientCommand::Unsubscribe { .. } => "unsubscribe",
            ClientCommand::Ack { .. } => "ack",
            ClientCommand::Ping => "ping",
        }
    }
}

#[derive(Deserialize)]
struct AuthPayload {
    token: String,
}

#[derive(Deserialize)]
struct ChannelsPayload {
    channels: Vec<String>,
}

#[derive(Deserialize)]
struct AckPayload {
    notification_id: String,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

/// 通知优先级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// 过期后是否值得重投
    pub fn redeliver_on_expiry(&self) -> bool {
        matches!(self, Priority::High | Priority::Urgent)
    }
}

/// 一条待投递通知（同时也是代理上的线格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// 通知 ID（客户端幂等去重的依据）
    pub notification_id: String,
    /// 目标身份
    pub identity: String,
    /// 所属频道
    pub channel: String,
    /// 业务类型
    pub notification_type: String,
    /// 优先级
    pub priority: Priority,
    /// 业务负载
    pub data: Value,
    /// 产生时间
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        identity: &str,
        channel: &str,
        notification_type: &str,
        priority: Priority,
        data: Value,
    ) -> Self {
        Self {
            notification_id: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            channel: channel.to_string(),
            notification_type: notification_type.to_string(),
            priority,
            data,
            created_at: Utc::now(),
        }
    }

    /// 转成下行 `notification` 报文，信封 id 即通知 ID
    pub fn to_envelope(&self) -> Envelope {
        Envelope::with_id(
            "notification",
            self.notification_id.clone(),
            serde_json::json!({
                "channel": self.channel,
                "notification_type": self.notification_type,
                "priority": self.priority,
                "data": self.data,
            }),
        )
    }
}

/// 服务端报文构建器
pub mod server {
    use super::*;

    /// 应答报文沿用请求的信封 id，客户端据此配对
    pub fn auth_success(
        message_id: &str,
        identity: &str,
        session_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Envelope {
        Envelope::with_id(
            "auth_success",
            message_id.to_string(),
            serde_json::json!({
                "identity": identity,
                "session_id": session_id,
                "expires_at": expires_at,
            }),
        )
    }

    pub fn auth_failed(code: AuthErrorCode, message: &str, retry_allowed: bool) -> Envelope {
        Envelope::new(
            "auth_failed",
            serde_json::json!({
                "error_code": code,
                "message": message,
                "retry_allowed": retry_allowed,
            }),
        )
    }

    pub fn subscribed(message_id: &str, channels: &[String]) -> Envelope {
        Envelope::with_id(
            "subscribed",
            message_id.to_string(),
            serde_json::json!({
                "channels": channels,
                "subscribed_at": Utc::now(),
            }),
        )
    }

    pub fn pong(message_id: &str) -> Envelope {
        Envelope::with_id("pong", message_id.to_string(), serde_json::json!({}))
    }

    /// 同身份新登录顶替旧连接时的下行通知
    pub fn superseded() -> Envelope {
        Envelope::new(
            "superseded",
            serde_json::json!({ "reason": "new login from the same identity" }),
        )
    }

    pub fn error(
        code: ErrorCode,
        message: &str,
        details: Option<Value>,
        original_message_id: Option<&str>,
    ) -> Envelope {
        let mut payload = serde_json::json!({
            "error_code": code,
            "message": message,
        });
        if let Some(details) = details {
            payload["details"] = details;
        }
        if let Some(id) = original_message_id {
            payload["original_message_id"] = Value::String(id.to_string());
        }
        Envelope::new("error", payload)
    }
}
