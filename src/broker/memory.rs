//! 进程内代理实现
//!
//! `InMemoryBus` 是多个网关实例（或测试）共享的总线；
//! `InMemoryBroker` 在其上模拟独立实例的订阅视图。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use super::{Broker, BrokerEvent};

const EVENT_BUS_CAPACITY: usize = 1024;

/// 共享总线
pub struct InMemoryBus {
    tx: broadcast::Sender<BrokerEvent>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Arc::new(Self { tx })
    }
}

/// 单实例的代理视图：只把本实例订阅过的频道事件转发出来
pub struct InMemoryBroker {
    bus: Arc<InMemoryBus>,
    subscribed: Arc<RwLock<HashSet<String>>>,
    out_tx: broadcast::Sender<BrokerEvent>,
    forwarder: JoinHandle<()>,
}

impl InMemoryBroker {
    pub fn new(bus: Arc<InMemoryBus>) -> Self {
        let subscribed: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(HashSet::new()));
        let (out_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let mut bus_rx = bus.tx.subscribe();
        let filter = subscribed.clone();
        let tx = out_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(event) = bus_rx.recv().await {
                if filter.read().await.contains(&event.channel) {
                    let _ = tx.send(event);
                }
            }
        });

        Self {
            bus,
            subscribed,
            out_tx,
            forwarder,
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let _ = self.bus.tx.send(BrokerEvent {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<()> {
        self.subscribed.write().await.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> anyhow::Result<()> {
        self.subscribed.write().await.remove(channel);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.out_tx.subscribe()
    }
}

impl Drop for InMemoryBroker {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_only_subscribed_channels_flow_through() {
        let bus = InMemoryBus::new();
        let a = InMemoryBroker::new(bus.clone());
        let b = InMemoryBroker::new(bus.clone());

        b.subscribe("alerts").await.unwrap();
        let mut b_events = b.events();

        a.publish("alerts", b"one".to_vec()).await.unwrap();
        a.publish("other", b"two".to_vec()).await.unwrap();

        let event = timeout(Duration::from_secs(1), b_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.channel, "alerts");
        assert_eq!(event.payload, b"one");

        // 未订阅频道的事件不会出现在流里
        assert!(timeout(Duration::from_millis(50), b_events.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        let broker = InMemoryBroker::new(bus.clone());
        broker.subscribe("alerts").await.unwrap();
        broker.unsubscribe("alerts").await.unwrap();
        let mut events = broker.events();

        broker.publish("alerts", b"x".to_vec()).await.unwrap();
        assert!(timeout(Duration::from_millis(50), events.recv())
            .await
            .is_err());
    }
}
