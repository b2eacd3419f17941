//! 基于 Redis 的会话存储实现

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::info;

use super::{SessionRecord, SessionStore};
use crate::error::{GatewayError, Result};

const SESSION_PREFIX: &str = "session:";

pub struct RedisSessionStore {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisSessionStore {
    /// 连接 Redis 并构建存储；ConnectionManager 断线后自动重连
    pub async fn connect(client: Arc<redis::Client>, ttl_seconds: u64) -> Result<Self> {
        let conn = ConnectionManager::new(client.as_ref().clone())
            .await
            .map_err(|e| GatewayError::Unavailable(format!("redis connection failed: {}", e)))?;
        Ok(Self { conn, ttl_seconds })
    }

    fn session_key(identity: &str) -> String {
        format!("{}{}", SESSION_PREFIX, identity)
    }

    async fn fetch(
        &self,
        conn: &mut ConnectionManager,
        identity: &str,
    ) -> Result<Option<SessionRecord>> {
        let payload: Option<String> = conn
            .get(Self::session_key(identity))
            .await
            .map_err(|e| GatewayError::Unavailable(format!("failed to get session: {}", e)))?;
        match payload {
            Some(raw) => {
                let record =
                    serde_json::from_str(&raw).context("invalid session record json")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn put(&self, record: SessionRecord) -> Result<Option<SessionRecord>> {
        let mut conn = self.conn.clone();
        let prior = self.fetch(&mut conn, &record.identity).await?;

        let json = serde_json::to_string(&record).context("failed to encode session record")?;
        let _: () = conn
            .set_ex(Self::session_key(&record.identity), json, self.ttl_seconds)
            .await
            .map_err(|e| GatewayError::Unavailable(format!("failed to set session: {}", e)))?;

        info!(
            identity = %record.identity,
            session_id = %record.session_id,
            gateway_id = %record.gateway_id,
            "session stored in redis"
        );
        Ok(prior.filter(|p| p.connection_id != record.connection_id))
    }

    async fn get(&self, identity: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.conn.clone();
        self.fetch(&mut conn, identity).await
    }

    async fn remove_if_current(&self, identity: &str, connection_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        match self.fetch(&mut conn, identity).await? {
            Some(record) if record.connection_id == connection_id => {
                let _: usize = conn.del(Self::session_key(identity)).await.map_err(|e| {
                    GatewayError::Unavailable(format!("failed to delete session: {}", e))
                })?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
