//! 本实例连接注册表
//!
//! 连接对象归持有 socket 的实例独占，跨实例只通过会话存储互通。
//! 出站走有界队列：路由扇出绝不等待慢连接，队列写满即判定
//! 慢客户端并强制断开，防止一个慢客户端拖垮其他连接。

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::Envelope;

/// 服务端发给连接任务的控制信号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// 同身份新登录顶替了该连接
    Superseded,
    /// 服务端主动关闭
    Shutdown(String),
}

/// 投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverResult {
    /// 已入出站队列
    Sent,
    /// 出站队列已满，连接被判定为慢客户端
    Overflow,
    /// 连接已不存在
    Gone,
}

/// 连接句柄：路由器与注册表看到的连接侧面
pub struct ConnectionHandle {
    pub connection_id: String,
    identity: RwLock<Option<String>>,
    outbound: mpsc::Sender<Envelope>,
    control: mpsc::Sender<ControlSignal>,
}

impl ConnectionHandle {
    pub fn new(
        connection_id: &str,
        outbound: mpsc::Sender<Envelope>,
        control: mpsc::Sender<ControlSignal>,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            identity: RwLock::new(None),
            outbound,
            control,
        }
    }

    /// 认证完成后绑定身份
    pub fn bind_identity(&self, identity: &str) {
        *self.identity.write().expect("identity lock") = Some(identity.to_string());
    }

    pub fn identity(&self) -> Option<String> {
        self.identity.read().expect("identity lock").clone()
    }
}

/// 连接注册表
pub struct ConnectionRegistry {
    inner: DashMap<String, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        self.inner.insert(handle.connection_id.clone(), handle);
    }

    pub fn unregister(&self, connection_id: &str) {
        self.inner.remove(connection_id);
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.inner.get(connection_id).map(|e| e.value().clone())
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    /// 非阻塞投递；溢出时向连接任务发关闭信号
    pub fn try_deliver(&self, connection_id: &str, envelope: Envelope) -> DeliverResult {
        let Some(handle) = self.get(connection_id) else {
            return DeliverResult::Gone;
        };
        match handle.outbound.try_send(envelope) {
            Ok(()) => DeliverResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id, "outbound queue full, disconnecting slow client");
                let _ = handle
                    .control
                    .try_send(ControlSignal::Shutdown("slow consumer".to_string()));
                DeliverResult::Overflow
            }
            Err(mpsc::error::TrySendError::Closed(_)) => DeliverResult::Gone,
        }
    }

    /// 向连接任务发控制信号（顶替/强制关闭），尽力而为
    pub fn signal(&self, connection_id: &str, signal: ControlSignal) {
        if let Some(handle) = self.get(connection_id) {
            debug!(connection_id, ?signal, "signaling connection");
            let _ = handle.control.try_send(signal);
        }
    }

    /// 向所有连接广播控制信号（关停时使用）
    pub fn broadcast(&self, signal: ControlSignal) {
        for entry in self.inner.iter() {
            let _ = entry.value().control.try_send(signal.clone());
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
