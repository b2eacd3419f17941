//! 内存会话存储（单实例部署与测试用）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SessionRecord, SessionStore};
use crate::error::Result;

#[derive(Default)]
pub struct InMemorySessionStore {
    inner: Arc<RwLock<HashMap<String, SessionRecord>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(&self, record: SessionRecord) -> Result<Option<SessionRecord>> {
        let mut guard = self.inner.write().await;
        let prior = guard.insert(record.identity.clone(), record.clone());
        Ok(prior.filter(|p| p.connection_id != record.connection_id))
    }

    async fn get(&self, identity: &str) -> Result<Option<SessionRecord>> {
        let guard = self.inner.read().await;
        Ok(guard.get(identity).cloned())
    }

    async fn remove_if_current(&self, identity: &str, connection_id: &str) -> Result<bool> {
        let mut guard = self.inner.write().await;
        match guard.get(identity) {
            Some(record) if record.connection_id == connection_id => {
                guard.remove(identity);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_reports_superseded_record() {
        let store = InMemorySessionStore::new();
        assert!(store
            .put(SessionRecord::new("u1", "s1", "gw-1", "c1"))
            .await
            .unwrap()
            .is_none());

        let prior = store
            .put(SessionRecord::new("u1", "s2", "gw-2", "c2"))
            .await
            .unwrap()
            .expect("prior record");
        assert_eq!(prior.connection_id, "c1");
    }

    #[tokio::test]
    async fn test_remove_only_if_current() {
        let store = InMemorySessionStore::new();
        store
            .put(SessionRecord::new("u1", "s1", "gw-1", "c1"))
            .await
            .unwrap();
        // 新登录顶掉旧会话
        store
            .put(SessionRecord::new("u1", "s2", "gw-1", "c2"))
            .await
            .unwrap();

        // 旧连接清理不能删掉新会话
        assert!(!store.remove_if_current("u1", "c1").await.unwrap());
        assert!(store.get("u1").await.unwrap().is_some());

        assert!(store.remove_if_current("u1", "c2").await.unwrap());
        assert!(store.get("u1").await.unwrap().is_none());
    }
}
