//! 共享发布/订阅代理接口
//!
//! 跨实例路由的唯一通道。代理本身是外部依赖（Redis Pub/Sub），
//! 这里只定义网关消费它的窄接口，并提供测试与单实例用的内存实现。

mod memory;
mod redis;

pub use memory::{InMemoryBroker, InMemoryBus};
pub use redis::RedisBroker;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// 从代理收到的一条事件
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// 代理契约
///
/// `publish`/`subscribe` 都可能独立阻塞或失败，调用方自行裹重试与超时。
#[async_trait]
pub trait Broker: Send + Sync {
    /// 向频道发布一条消息
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// 订阅频道，事件经 [`Broker::events`] 流出
    async fn subscribe(&self, channel: &str) -> anyhow::Result<()>;

    /// 退订频道
    async fn unsubscribe(&self, channel: &str) -> anyhow::Result<()>;

    /// 获取事件流接收端
    fn events(&self) -> broadcast::Receiver<BrokerEvent>;
}
