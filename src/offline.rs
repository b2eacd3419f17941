//! 离线通知暂存
//!
//! 目标身份没有活跃会话时，事件路由器把通知交给这里而不是丢弃，
//! 重连认证成功后按序回放。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::RwLock;
use tracing::debug;

use crate::protocol::Notification;

/// 离线暂存契约
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// 暂存一条无法即时投递的通知
    async fn store(&self, notification: &Notification) -> anyhow::Result<()>;

    /// 取出并清空某身份的全部暂存通知（按暂存顺序）
    async fn drain(&self, identity: &str) -> anyhow::Result<Vec<Notification>>;
}

/// 内存实现
#[derive(Default)]
pub struct InMemoryOfflineStore {
    inner: Arc<RwLock<HashMap<String, Vec<Notification>>>>,
}

impl InMemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineStore for InMemoryOfflineStore {
    async fn store(&self, notification: &Notification) -> anyhow::Result<()> {
        let mut guard = self.inner.write().await;
        guard
            .entry(notification.identity.clone())
            .or_default()
            .push(notification.clone());
        Ok(())
    }

    async fn drain(&self, identity: &str) -> anyhow::Result<Vec<Notification>> {
        let mut guard = self.inner.write().await;
        Ok(guard.remove(identity).unwrap_or_default())
    }
}

const OFFLINE_PREFIX: &str = "offline:";

/// Redis 列表实现，按身份一个 list，带 TTL
pub struct RedisOfflineStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisOfflineStore {
    /// 连接 Redis 并构建暂存；ConnectionManager 断线后自动重连
    pub async fn connect(client: Arc<redis::Client>, ttl_seconds: u64) -> anyhow::Result<Self> {
        let conn = ConnectionManager::new(client.as_ref().clone())
            .await
            .context("failed to open redis connection")?;
        Ok(Self { conn, ttl_seconds })
    }

    fn key(identity: &str) -> String {
        format!("{}{}", OFFLINE_PREFIX, identity)
    }
}

#[async_trait]
impl OfflineStore for RedisOfflineStore {
    async fn store(&self, notification: &Notification) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::key(&notification.identity);
        let payload =
            serde_json::to_string(notification).context("failed to encode notification")?;
        let _: usize = conn
            .rpush(&key, payload)
            .await
            .context("failed to append offline notification")?;
        let _: bool = conn
            .expire(&key, self.ttl_seconds as i64)
            .await
            .context("failed to set offline list ttl")?;
        debug!(identity = %notification.identity, notification_id = %notification.notification_id, "notification parked offline");
        Ok(())
    }

    async fn drain(&self, identity: &str) -> anyhow::Result<Vec<Notification>> {
        let mut conn = self.conn.clone();
        let key = Self::key(identity);
        let raw: Vec<String> = conn
            .lrange(&key, 0, -1)
            .await
            .context("failed to read offline notifications")?;
        let _: usize = conn
            .del(&key)
            .await
            .context("failed to clear offline notifications")?;

        let mut notifications = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(n) => notifications.push(n),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode offline notification, skipped")
                }
            }
        }
        Ok(notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Priority;

    #[tokio::test]
    async fn test_store_and_drain_preserves_order() {
        let store = InMemoryOfflineStore::new();
        for i in 0..3 {
            let mut n = Notification::new(
                "user-1",
                "alerts",
                "system_alert",
                Priority::Normal,
                serde_json::json!({"seq": i}),
            );
            n.notification_id = format!("n-{}", i);
            store.store(&n).await.unwrap();
        }

        let drained = store.drain("user-1").await.unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].notification_id, "n-0");
        assert_eq!(drained[2].notification_id, "n-2");

        // 第二次取已为空
        assert!(store.drain("user-1").await.unwrap().is_empty());
    }
}
