//! 事件路由器
//!
//! 入站：消费代理事件流，投递给订阅该频道且身份匹配的本地连接。
//! 事件始终是身份限定的：频道订阅不构成授权，目标身份必须等于
//! 连接的认证身份，频道名冲突也不会造成跨身份泄露。
//!
//! 出站：目标身份归本实例则直接投递；归他实例则发布到该实例的
//! 专属投递频道（每个实例启动即订阅自己的投递频道，收到后本地
//! 投递或转离线，事件不会因对端频道订阅缺位而落空）；无活跃会话
//! 则转入离线暂存，绝不静默丢弃。
//!
//! 投递语义是至少一次，客户端以通知 ID 幂等去重。

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ack::{DeliveryTracker, ExpiryHandler, PendingNotification};
use crate::broker::Broker;
use crate::connection::{ConnectionRegistry, ControlSignal, DeliverResult};
use crate::error::{GatewayError, Result};
use crate::metrics::GatewayMetrics;
use crate::protocol::{Notification, Priority};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::session::{SessionRecord, SessionStore};
use crate::offline::OfflineStore;
use crate::subscription::SubscriptionTable;

const CHANNEL_PREFIX: &str = "pulse:chan:";
const CONTROL_PREFIX: &str = "pulse:ctl:";
const GATEWAY_PREFIX: &str = "pulse:gw:";

/// 实例间控制消息（经代理的点对点、尽力而为信号）
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ControlMessage {
    /// 顶掉指定连接：同身份在别处完成了新登录
    Supersede {
        identity: String,
        connection_id: String,
    },
}

fn broker_channel(channel: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, channel)
}

fn control_channel(gateway_id: &str) -> String {
    format!("{}{}", CONTROL_PREFIX, gateway_id)
}

fn gateway_channel(gateway_id: &str) -> String {
    format!("{}{}", GATEWAY_PREFIX, gateway_id)
}

/// 事件路由器
pub struct EventRouter {
    gateway_id: String,
    broker: Arc<dyn Broker>,
    sessions: Arc<dyn SessionStore>,
    subscriptions: Arc<SubscriptionTable>,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<DeliveryTracker>,
    offline: Arc<dyn OfflineStore>,
    retry: RetryPolicy,
    metrics: Arc<GatewayMetrics>,
}

impl EventRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway_id: &str,
        broker: Arc<dyn Broker>,
        sessions: Arc<dyn SessionStore>,
        subscriptions: Arc<SubscriptionTable>,
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<DeliveryTracker>,
        offline: Arc<dyn OfflineStore>,
        retry: RetryPolicy,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            gateway_id: gateway_id.to_string(),
            broker,
            sessions,
            subscriptions,
            registry,
            tracker,
            offline,
            retry,
            metrics,
        }
    }

    /// 启动入站消费循环
    ///
    /// 控制频道与专属投递频道在此订阅，先于任何连接接入：
    /// 跨实例投递不依赖本实例是否已有对应频道的订阅者。
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        self.broker
            .subscribe(&control_channel(&self.gateway_id))
            .await
            .context("failed to subscribe control channel")?;
        self.broker
            .subscribe(&gateway_channel(&self.gateway_id))
            .await
            .context("failed to subscribe gateway delivery channel")?;

        let router = self.clone();
        let mut events = self.broker.events();
        Ok(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => router.handle_broker_event(&event.channel, &event.payload).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // 落后即丢失，可见地记录而不是悄悄吞掉
                        error!(skipped, "broker event stream lagged, events lost");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("broker event stream closed, router loop exiting");
                        break;
                    }
                }
            }
        }))
    }

    async fn handle_broker_event(&self, channel: &str, payload: &[u8]) {
        if channel == control_channel(&self.gateway_id) {
            match serde_json::from_slice::<ControlMessage>(payload) {
                Ok(ControlMessage::Supersede {
                    identity,
                    connection_id,
                }) => {
                    info!(identity, connection_id, "supersede signal received");
                    self.registry.signal(&connection_id, ControlSignal::Superseded);
                }
                Err(e) => warn!(error = %e, "invalid control message"),
            }
            return;
        }

        // 专属投递频道：本实例持有目标会话，投不出去必须转离线
        if channel == gateway_channel(&self.gateway_id) {
            match serde_json::from_slice::<Notification>(payload) {
                Ok(notification) => {
                    if self.deliver_local(&notification) == 0 {
                        debug!(
                            notification_id = %notification.notification_id,
                            "addressed event matched no local connection, parking offline"
                        );
                        self.park_offline(&notification).await;
                    }
                }
                Err(e) => warn!(channel, error = %e, "invalid notification payload"),
            }
            return;
        }

        if channel.strip_prefix(CHANNEL_PREFIX).is_some() {
            match serde_json::from_slice::<Notification>(payload) {
                Ok(notification) => {
                    if self.deliver_local(&notification) == 0 {
                        // 频道广播会到达所有订阅实例；只有会话归属方
                        // （或无会话时）才暂存，避免旁观实例各存一份
                        self.park_if_owner(&notification).await;
                    }
                }
                Err(e) => warn!(channel, error = %e, "invalid notification payload"),
            }
        }
    }

    /// 本实例持有目标会话或查无会话时暂存；归他实例则由归属方处置
    async fn park_if_owner(&self, notification: &Notification) {
        let owns = match self.sessions.get(&notification.identity).await {
            Ok(Some(record)) => record.gateway_id == self.gateway_id,
            Ok(None) => true,
            Err(e) => {
                // 会话存储不可用时按离线处理，客户端以通知 ID 幂等去重
                warn!(
                    identity = %notification.identity,
                    error = %e,
                    "session lookup failed, parking offline"
                );
                true
            }
        };
        if owns {
            self.park_offline(notification).await;
        } else {
            debug!(
                notification_id = %notification.notification_id,
                "session owned elsewhere, owner parks instead"
            );
        }
    }

    /// 生产方入口：为某身份发布一条通知
    ///
    /// 返回通知 ID。无活跃会话时通知进入离线暂存而非丢弃。
    pub async fn dispatch(
        &self,
        identity: &str,
        channel: &str,
        notification_type: &str,
        priority: Priority,
        data: Value,
    ) -> Result<String> {
        let notification = Notification::new(identity, channel, notification_type, priority, data);
        self.route(&notification).await?;
        Ok(notification.notification_id)
    }

    async fn route(&self, notification: &Notification) -> Result<()> {
        match self.sessions.get(&notification.identity).await? {
            Some(record) if record.gateway_id == self.gateway_id => {
                let delivered = self.deliver_local(notification);
                if delivered == 0 {
                    self.park_offline(notification).await;
                }
                Ok(())
            }
            Some(record) => self.publish_remote(&record.gateway_id, notification).await,
            None => {
                self.park_offline(notification).await;
                Ok(())
            }
        }
    }

    /// 投递给本实例上订阅频道且身份匹配的连接
    fn deliver_local(&self, notification: &Notification) -> usize {
        let mut delivered = 0;
        for connection_id in self.subscriptions.connections_for(&notification.channel) {
            let identity_matches = self
                .registry
                .get(&connection_id)
                .and_then(|h| h.identity())
                .map(|id| id == notification.identity)
                .unwrap_or(false);
            if !identity_matches {
                continue;
            }

            self.tracker.record_sent(&connection_id, notification);
            match self
                .registry
                .try_deliver(&connection_id, notification.to_envelope())
            {
                DeliverResult::Sent => {
                    delivered += 1;
                    self.metrics.notifications_delivered_total.inc();
                    let age = (chrono::Utc::now() - notification.created_at)
                        .num_milliseconds()
                        .max(0) as f64
                        / 1000.0;
                    self.metrics.delivery_latency_seconds.observe(age);
                }
                DeliverResult::Overflow | DeliverResult::Gone => {
                    self.tracker.discard(&notification.notification_id);
                }
            }
        }
        delivered
    }

    /// 发布到归属实例的专属投递频道，有界重试后可见地失败
    ///
    /// 归属实例启动时就订阅了自己的投递频道，事件必达其路由循环，
    /// 由其投递或转离线。
    async fn publish_remote(&self, gateway_id: &str, notification: &Notification) -> Result<()> {
        let payload = serde_json::to_vec(notification).context("failed to encode notification")?;
        let channel = gateway_channel(gateway_id);
        let result = execute_with_retry(&self.retry, "broker publish", || {
            self.broker.publish(&channel, payload.clone())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics.broker_publish_failure_total.inc();
                error!(
                    notification_id = %notification.notification_id,
                    channel = %notification.channel,
                    error = %e,
                    "cross-instance delivery failed"
                );
                Err(GatewayError::Unavailable(
                    "broker publish failed".to_string(),
                ))
            }
        }
    }

    async fn park_offline(&self, notification: &Notification) {
        match self.offline.store(notification).await {
            Ok(()) => self.metrics.offline_stored_total.inc(),
            Err(e) => {
                // 离线路径也失败时只能计数并留痕
                self.metrics.broker_publish_failure_total.inc();
                error!(
                    notification_id = %notification.notification_id,
                    error = %e,
                    "failed to park notification offline"
                );
            }
        }
    }

    /// 订阅表变化后同步代理订阅
    pub async fn sync_subscriptions(&self, newly_active: &[String], deactivated: &[String]) {
        for channel in newly_active {
            if let Err(e) = self.broker.subscribe(&broker_channel(channel)).await {
                warn!(channel, error = %e, "broker subscribe failed, cross-instance events degraded");
            }
        }
        for channel in deactivated {
            if let Err(e) = self.broker.unsubscribe(&broker_channel(channel)).await {
                warn!(channel, error = %e, "broker unsubscribe failed");
            }
        }
    }

    /// 认证成功后把积压通知直接回放到新连接
    ///
    /// 离线通知本就是身份限定的，回放不要求客户端已重新订阅频道。
    pub async fn replay_offline(&self, identity: &str, connection_id: &str) {
        let parked = match self.offline.drain(identity).await {
            Ok(parked) => parked,
            Err(e) => {
                warn!(identity, error = %e, "offline replay fetch failed");
                return;
            }
        };
        if parked.is_empty() {
            return;
        }
        info!(identity, count = parked.len(), "replaying offline notifications");
        for notification in parked {
            self.tracker.record_sent(connection_id, &notification);
            match self
                .registry
                .try_deliver(connection_id, notification.to_envelope())
            {
                DeliverResult::Sent => {
                    self.metrics.notifications_delivered_total.inc();
                }
                DeliverResult::Overflow | DeliverResult::Gone => {
                    self.tracker.discard(&notification.notification_id);
                    self.park_offline(&notification).await;
                }
            }
        }
    }

    /// 顶掉旧会话：本地直接发信号，异地经代理控制频道尽力通知
    pub async fn supersede(&self, prior: &SessionRecord) {
        if prior.gateway_id == self.gateway_id {
            self.registry
                .signal(&prior.connection_id, ControlSignal::Superseded);
            return;
        }
        let message = ControlMessage::Supersede {
            identity: prior.identity.clone(),
            connection_id: prior.connection_id.clone(),
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode supersede signal");
                return;
            }
        };
        if let Err(e) = self
            .broker
            .publish(&control_channel(&prior.gateway_id), payload)
            .await
        {
            warn!(
                gateway_id = %prior.gateway_id,
                error = %e,
                "supersede signal publish failed (best effort)"
            );
        }
    }
}

#[async_trait]
impl ExpiryHandler for EventRouter {
    /// 过期处置：高优先级在预算内重投，否则转离线；低优先级放弃（已计数）
    async fn handle_expired(&self, expired: Vec<PendingNotification>) {
        for entry in expired {
            if !entry.notification.priority.redeliver_on_expiry() {
                debug!(
                    notification_id = %entry.notification.notification_id,
                    "expired notification dropped (low priority)"
                );
                continue;
            }

            let can_redeliver = entry.redeliveries < self.tracker.max_redeliveries()
                && self.registry.get(&entry.connection_id).is_some();
            if can_redeliver {
                let count = self.tracker.record_redelivery(&entry.connection_id, &entry);
                match self
                    .registry
                    .try_deliver(&entry.connection_id, entry.notification.to_envelope())
                {
                    DeliverResult::Sent => {
                        debug!(
                            notification_id = %entry.notification.notification_id,
                            redeliveries = count,
                            "notification redelivered"
                        );
                        continue;
                    }
                    _ => self.tracker.discard(&entry.notification.notification_id),
                }
            }
            self.park_offline(&entry.notification).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckConfig;
    use crate::broker::{InMemoryBroker, InMemoryBus};
    use crate::connection::ConnectionHandle;
    use crate::offline::InMemoryOfflineStore;
    use crate::session::InMemorySessionStore;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Instance {
        router: Arc<EventRouter>,
        sessions: Arc<InMemorySessionStore>,
        subscriptions: Arc<SubscriptionTable>,
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<DeliveryTracker>,
        offline: Arc<InMemoryOfflineStore>,
    }

    async fn instance(gateway_id: &str, bus: &Arc<InMemoryBus>, sessions: Arc<InMemorySessionStore>) -> Instance {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new(bus.clone()));
        let subscriptions = Arc::new(SubscriptionTable::new(10));
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(GatewayMetrics::unregistered());
        let tracker = Arc::new(DeliveryTracker::new(AckConfig::default(), metrics.clone()));
        let offline = Arc::new(InMemoryOfflineStore::new());
        let router = Arc::new(EventRouter::new(
            gateway_id,
            broker,
            sessions.clone(),
            subscriptions.clone(),
            registry.clone(),
            tracker.clone(),
            offline.clone(),
            RetryPolicy { max_attempts: 2, initial_delay_ms: 1, ..RetryPolicy::default() },
            metrics,
        ));
        router.start().await.unwrap();
        Instance {
            router,
            sessions,
            subscriptions,
            registry,
            tracker,
            offline,
        }
    }

    /// 在实例上挂一条已认证、已订阅的连接
    async fn attach_connection(
        inst: &Instance,
        connection_id: &str,
        identity: &str,
        channel: &str,
    ) -> mpsc::Receiver<crate::protocol::Envelope> {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (ctl_tx, _ctl_rx) = mpsc::channel(4);
        let handle = Arc::new(ConnectionHandle::new(connection_id, out_tx, ctl_tx));
        handle.bind_identity(identity);
        inst.registry.register(handle);
        let outcome = inst
            .subscriptions
            .subscribe(connection_id, &[channel.to_string()], &[channel.to_string()])
            .unwrap();
        inst.router
            .sync_subscriptions(&outcome.newly_active, &[])
            .await;
        inst.sessions
            .put(SessionRecord::new(identity, "s1", "local", connection_id))
            .await
            .unwrap();
        out_rx
    }

    #[tokio::test]
    async fn test_local_dispatch_delivers_and_tracks() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let inst = instance("local", &bus, sessions).await;
        let mut out_rx = attach_connection(&inst, "c1", "user-1", "error_docs").await;

        let id = inst
            .router
            .dispatch(
                "user-1",
                "error_docs",
                "doc_match",
                Priority::High,
                serde_json::json!({"doc": "ownership"}),
            )
            .await
            .unwrap();

        let envelope = timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.kind, "notification");
        assert_eq!(envelope.id, id);
        assert!(inst.tracker.is_pending(&id));
    }

    #[tokio::test]
    async fn test_cross_instance_delivery() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let a = instance("gw-a", &bus, sessions.clone()).await;
        let b = instance("gw-b", &bus, sessions.clone()).await;

        // user-1 的连接在 b 上
        let mut out_rx = attach_connection(&b, "c1", "user-1", "alerts").await;
        sessions
            .put(SessionRecord::new("user-1", "s1", "gw-b", "c1"))
            .await
            .unwrap();

        // a 上的生产者发布，经代理路由到 b
        a.router
            .dispatch(
                "user-1",
                "alerts",
                "system_alert",
                Priority::Urgent,
                serde_json::json!({"msg": "disk full"}),
            )
            .await
            .unwrap();

        let envelope = timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.kind, "notification");
        let payload = envelope.payload.unwrap();
        assert_eq!(payload["channel"], "alerts");
    }

    #[tokio::test]
    async fn test_remote_delivery_before_resubscribe_parks_on_owner() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let a = instance("gw-a", &bus, sessions.clone()).await;
        let b = instance("gw-b", &bus, sessions.clone()).await;

        // user-1 已在 b 上认证，但尚未重新订阅任何频道（重连窗口）
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (ctl_tx, _ctl_rx) = mpsc::channel(4);
        let handle = Arc::new(ConnectionHandle::new("c1", out_tx, ctl_tx));
        handle.bind_identity("user-1");
        b.registry.register(handle);
        sessions
            .put(SessionRecord::new("user-1", "s1", "gw-b", "c1"))
            .await
            .unwrap();

        let id = a
            .router
            .dispatch(
                "user-1",
                "alerts",
                "system_alert",
                Priority::High,
                serde_json::json!({"msg": "disk full"}),
            )
            .await
            .unwrap();

        // 事件必达归属实例；投不出去就转入其离线暂存，绝不落空
        let mut parked = Vec::new();
        for _ in 0..50 {
            parked = b.offline.drain("user-1").await.unwrap();
            if !parked.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].notification_id, id);
    }

    #[tokio::test]
    async fn test_bystander_instance_does_not_park_channel_events() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let c = instance("gw-c", &bus, sessions.clone()).await;

        // gw-c 上只有 user-2 订阅 alerts；user-1 的会话归 gw-b
        let mut out_rx = attach_connection(&c, "c2", "user-2", "alerts").await;
        sessions
            .put(SessionRecord::new("user-1", "s1", "gw-b", "c-remote"))
            .await
            .unwrap();

        let stray = Notification::new(
            "user-1",
            "alerts",
            "system_alert",
            Priority::Normal,
            serde_json::json!({}),
        );
        let payload = serde_json::to_vec(&stray).unwrap();
        c.router
            .broker
            .publish(&broker_channel("alerts"), payload)
            .await
            .unwrap();

        // 身份归他实例：旁观实例投不出也不暂存，归属方负责处置
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(c.offline.drain("user-1").await.unwrap().is_empty());

        // 同一路径上，身份匹配的本地订阅者照常收到
        let addressed = Notification::new(
            "user-2",
            "alerts",
            "system_alert",
            Priority::Normal,
            serde_json::json!({"msg": "ok"}),
        );
        let payload = serde_json::to_vec(&addressed).unwrap();
        c.router
            .broker
            .publish(&broker_channel("alerts"), payload)
            .await
            .unwrap();
        let envelope = timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.kind, "notification");
        assert_eq!(envelope.id, addressed.notification_id);
    }

    #[tokio::test]
    async fn test_identity_mismatch_not_delivered() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let inst = instance("local", &bus, sessions).await;
        // 连接订阅了频道，但身份不同
        let mut out_rx = attach_connection(&inst, "c1", "user-2", "error_docs").await;
        inst.sessions
            .put(SessionRecord::new("user-1", "s9", "local", "c-elsewhere"))
            .await
            .unwrap();

        inst.router
            .dispatch(
                "user-1",
                "error_docs",
                "doc_match",
                Priority::Normal,
                serde_json::json!({}),
            )
            .await
            .unwrap();

        // 频道相同身份不同的连接收不到任何东西
        assert!(timeout(Duration::from_millis(100), out_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_offline_identity_parks_notification() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let inst = instance("local", &bus, sessions).await;

        let id = inst
            .router
            .dispatch(
                "ghost",
                "alerts",
                "system_alert",
                Priority::Normal,
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let parked = inst.offline.drain("ghost").await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].notification_id, id);
    }

    #[tokio::test]
    async fn test_replay_offline_on_reconnect() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let inst = instance("local", &bus, sessions).await;

        inst.router
            .dispatch("user-1", "alerts", "system_alert", Priority::High, serde_json::json!({"seq": 1}))
            .await
            .unwrap();

        // 重连后回放，无需等待重新订阅
        let mut out_rx = attach_connection(&inst, "c1", "user-1", "alerts").await;
        inst.router.replay_offline("user-1", "c1").await;

        let envelope = timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.kind, "notification");
        assert!(inst.offline.drain("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_supersede_signals_connection() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let inst = instance("local", &bus, sessions).await;

        let (out_tx, _out_rx) = mpsc::channel(4);
        let (ctl_tx, mut ctl_rx) = mpsc::channel(4);
        inst.registry
            .register(Arc::new(ConnectionHandle::new("c-old", out_tx, ctl_tx)));

        let prior = SessionRecord::new("user-1", "s-old", "local", "c-old");
        inst.router.supersede(&prior).await;

        assert_eq!(
            timeout(Duration::from_secs(1), ctl_rx.recv())
                .await
                .unwrap()
                .unwrap(),
            ControlSignal::Superseded
        );
    }

    #[tokio::test]
    async fn test_remote_supersede_travels_over_broker() {
        let bus = InMemoryBus::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let a = instance("gw-a", &bus, sessions.clone()).await;
        let b = instance("gw-b", &bus, sessions).await;

        let (out_tx, _out_rx) = mpsc::channel(4);
        let (ctl_tx, mut ctl_rx) = mpsc::channel(4);
        b.registry
            .register(Arc::new(ConnectionHandle::new("c-old", out_tx, ctl_tx)));

        let prior = SessionRecord::new("user-1", "s-old", "gw-b", "c-old");
        a.router.supersede(&prior).await;

        assert_eq!(
            timeout(Duration::from_secs(1), ctl_rx.recv())
                .await
                .unwrap()
                .unwrap(),
            ControlSignal::Superseded
        );
    }
}
