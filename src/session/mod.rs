//! 会话存储
//!
//! 共享存储中「身份 → 当前服务实例/连接」的映射，跨实例路由的唯一事实来源。
//! 设计取单会话语义：同一身份的新登录顶掉旧会话。

mod memory;
mod redis;

pub use memory::InMemorySessionStore;
pub use redis::RedisSessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 会话记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    /// 认证身份
    pub identity: String,
    /// 会话 ID
    pub session_id: String,
    /// 持有连接的网关实例
    pub gateway_id: String,
    /// 连接 ID
    pub connection_id: String,
    /// 建立时间
    pub connected_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(identity: &str, session_id: &str, gateway_id: &str, connection_id: &str) -> Self {
        Self {
            identity: identity.to_string(),
            session_id: session_id.to_string(),
            gateway_id: gateway_id.to_string(),
            connection_id: connection_id.to_string(),
            connected_at: Utc::now(),
        }
    }
}

/// 会话存储契约
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 写入会话记录，返回被顶掉的旧记录（如有）
    async fn put(&self, record: SessionRecord) -> Result<Option<SessionRecord>>;

    /// 查询身份当前的会话记录
    async fn get(&self, identity: &str) -> Result<Option<SessionRecord>>;

    /// 仅当记录仍指向该连接时删除，返回是否删除
    ///
    /// 并发顶替产生的新记录不会被旧连接的清理误删
    async fn remove_if_current(&self, identity: &str, connection_id: &str) -> Result<bool>;
}
