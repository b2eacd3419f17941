//! Redis Pub/Sub 代理实现
//!
//! 独立的 PubSub 连接拆成 sink（订阅控制）与 stream（事件读取），
//! 读取任务把事件汇入进程内 broadcast 总线。发布走共享的
//! ConnectionManager。

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::AsyncCommands;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Broker, BrokerEvent};

const EVENT_BUS_CAPACITY: usize = 1024;

pub struct RedisBroker {
    publish_conn: ConnectionManager,
    sink: Mutex<PubSubSink>,
    out_tx: broadcast::Sender<BrokerEvent>,
    reader: JoinHandle<()>,
}

impl RedisBroker {
    pub async fn connect(client: Arc<redis::Client>) -> anyhow::Result<Self> {
        let pubsub = client
            .get_async_pubsub()
            .await
            .context("failed to open redis pubsub connection")?;
        let (sink, mut stream) = pubsub.split();

        let (out_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let event = BrokerEvent {
                    channel: msg.get_channel_name().to_string(),
                    payload: msg.get_payload_bytes().to_vec(),
                };
                // 没有接收者时丢弃即可，订阅端尚未就绪
                let _ = tx.send(event);
            }
            warn!("redis pubsub stream closed");
        });

        let publish_conn = ConnectionManager::new(client.as_ref().clone())
            .await
            .context("failed to open redis connection")?;

        info!("redis broker connected");
        Ok(Self {
            publish_conn,
            sink: Mutex::new(sink),
            out_tx,
            reader,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut conn = self.publish_conn.clone();
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .with_context(|| format!("failed to publish to {}", channel))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.subscribe(channel)
            .await
            .with_context(|| format!("failed to subscribe to {}", channel))
    }

    async fn unsubscribe(&self, channel: &str) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.unsubscribe(channel)
            .await
            .with_context(|| format!("failed to unsubscribe from {}", channel))
    }

    fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.out_tx.subscribe()
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 需要本地运行的 Redis 实例
    #[tokio::test]
    #[ignore]
    async fn test_publish_subscribe_roundtrip() -> anyhow::Result<()> {
        let client = Arc::new(redis::Client::open("redis://127.0.0.1/")?);
        let broker = RedisBroker::connect(client).await?;
        let mut events = broker.events();

        broker.subscribe("it-channel").await?;
        broker.publish("it-channel", b"hello".to_vec()).await?;

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
            .await?
            .unwrap();
        assert_eq!(event.channel, "it-channel");
        assert_eq!(event.payload, b"hello");
        Ok(())
    }
}
