//! 连接生命周期控制
//!
//! 状态机 `Connecting → Authenticating → Authenticated → Closing → Closed`，
//! 每条连接一个专属任务，入站帧经 mpsc 串行处理，不存在回调重入。
//! 认证时限与空闲时限是仅有的两个定时等待，任务退出即随 select 一起取消。
//!
//! 传输层错误不做服务端重试，重连是客户端的职责；这里只保证
//! 干净、幂等的拆除。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::{ConnectionHandle, ConnectionRegistry, ControlSignal};
use crate::ack::DeliveryTracker;
use crate::auth::{AuthGate, AuthSuccess};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::offline::OfflineStore;
use crate::protocol::{server, ClientCommand, Envelope};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::router::EventRouter;
use crate::session::{SessionRecord, SessionStore};
use crate::subscription::SubscriptionTable;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 认证时限内未完成认证
    AuthTimeout,
    /// 认证失败（不可重试的失败码）
    AuthFailed,
    /// 空闲超时
    IdleTimeout,
    /// 客户端断开
    ClientDisconnect,
    /// 被同身份新登录顶替
    Superseded,
    /// 持续违规触发限流升级
    RateLimitEscalation,
    /// 服务端主动关闭
    Shutdown(String),
}

/// 连接任务的共享依赖
pub struct ConnectionContext {
    pub config: Arc<GatewayConfig>,
    pub auth: Arc<dyn AuthGate>,
    pub sessions: Arc<dyn SessionStore>,
    pub subscriptions: Arc<SubscriptionTable>,
    pub router: Arc<EventRouter>,
    pub tracker: Arc<DeliveryTracker>,
    pub limiter: Arc<RateLimiter>,
    pub registry: Arc<ConnectionRegistry>,
    pub offline: Arc<dyn OfflineStore>,
    pub metrics: Arc<GatewayMetrics>,
}

/// 已启动连接：传输层喂入站帧、取出站报文的端点
pub struct SpawnedConnection {
    pub connection_id: String,
    pub inbound: mpsc::Sender<String>,
    pub outbound: mpsc::Receiver<Envelope>,
    pub join: JoinHandle<()>,
}

/// 连接生命周期控制器
pub struct ConnectionActor {
    connection_id: String,
    session_id: String,
    state: ConnectionState,
    auth: Option<AuthSuccess>,
    ctx: Arc<ConnectionContext>,
    inbound: mpsc::Receiver<String>,
    control: mpsc::Receiver<ControlSignal>,
    outbound: mpsc::Sender<Envelope>,
}

impl ConnectionActor {
    /// 为一条新传输会话启动连接任务
    pub fn spawn(ctx: Arc<ConnectionContext>) -> SpawnedConnection {
        let connection_id = format!("conn-{}", Uuid::new_v4());
        let (in_tx, in_rx) = mpsc::channel(32);
        let (out_tx, out_rx) = mpsc::channel(ctx.config.limits.outbound_queue);
        let (ctl_tx, ctl_rx) = mpsc::channel(8);

        let handle = Arc::new(ConnectionHandle::new(
            &connection_id,
            out_tx.clone(),
            ctl_tx,
        ));
        ctx.registry.register(handle);
        ctx.metrics.connections_total.inc();
        ctx.metrics
            .connections_active
            .set(ctx.registry.count() as i64);

        let actor = Self {
            connection_id: connection_id.clone(),
            session_id: format!("sess-{}", Uuid::new_v4()),
            state: ConnectionState::Connecting,
            auth: None,
            ctx,
            inbound: in_rx,
            control: ctl_rx,
            outbound: out_tx,
        };
        let join = tokio::spawn(actor.run());

        SpawnedConnection {
            connection_id,
            inbound: in_tx,
            outbound: out_rx,
            join,
        }
    }

    async fn run(mut self) {
        // 传输握手已完成，进入认证窗口
        self.state = ConnectionState::Authenticating;
        debug!(connection_id = %self.connection_id, "connection accepted, awaiting auth");

        let auth_deadline =
            Instant::now() + Duration::from_secs(self.ctx.config.auth.auth_timeout_secs);
        let idle_timeout = Duration::from_secs(self.ctx.config.limits.idle_timeout_secs);
        let mut idle_deadline = Instant::now() + idle_timeout;

        let reason = loop {
            tokio::select! {
                frame = self.inbound.recv() => match frame {
                    Some(raw) => {
                        idle_deadline = Instant::now() + idle_timeout;
                        if let Some(reason) = self.handle_frame(&raw).await {
                            break reason;
                        }
                    }
                    None => break CloseReason::ClientDisconnect,
                },
                signal = self.control.recv() => match signal {
                    Some(ControlSignal::Superseded) => {
                        self.try_send(server::superseded());
                        break CloseReason::Superseded;
                    }
                    Some(ControlSignal::Shutdown(why)) => break CloseReason::Shutdown(why),
                    None => break CloseReason::Shutdown("server stopping".to_string()),
                },
                _ = tokio::time::sleep_until(auth_deadline), if self.auth.is_none() => {
                    break CloseReason::AuthTimeout;
                }
                _ = tokio::time::sleep_until(idle_deadline) => break CloseReason::IdleTimeout,
            }
        };

        self.close(reason).await;
    }

    /// 处理一帧入站数据；返回 Some 表示连接应进入关闭
    async fn handle_frame(&mut self, raw: &str) -> Option<CloseReason> {
        let envelope = match Envelope::decode(raw, self.ctx.config.limits.max_message_bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                // 协议错误可恢复，连接保持打开
                self.reply_error(&e, None);
                return None;
            }
        };
        let message_id = envelope.id.clone();

        let command = match envelope.client_command() {
            Ok(command) => command,
            Err(e) => {
                self.reply_error(&e, Some(&message_id));
                return None;
            }
        };

        self.ctx
            .metrics
            .messages_in_total
            .with_label_values(&[command.kind()])
            .inc();

        // 认证前按连接 ID 限流，认证后按身份限流
        let limiter_key = self
            .auth
            .as_ref()
            .map(|a| a.identity.clone())
            .unwrap_or_else(|| self.connection_id.clone());
        match self.ctx.limiter.consume(&limiter_key, command.kind()) {
            RateDecision::Allowed => {}
            RateDecision::Denied { retry_after } => {
                self.ctx.metrics.rate_limited_total.inc();
                self.reply_error(
                    &GatewayError::RateLimited {
                        retry_after_ms: retry_after.as_millis() as u64,
                    },
                    Some(&message_id),
                );
                return None;
            }
            RateDecision::Escalate => {
                warn!(connection_id = %self.connection_id, "rate limit escalation, closing");
                return Some(CloseReason::RateLimitEscalation);
            }
        }

        match command {
            ClientCommand::Auth { token } => self.handle_auth(&token, &message_id).await,
            ClientCommand::Subscribe { channels } => {
                self.handle_subscribe(&channels, &message_id).await;
                None
            }
            ClientCommand::Unsubscribe { channels } => {
                self.handle_unsubscribe(&channels, &message_id).await;
                None
            }
            ClientCommand::Ack {
                notification_id, ..
            } => {
                self.handle_ack(&notification_id, &message_id);
                None
            }
            ClientCommand::Ping => {
                self.try_send(server::pong(&message_id));
                None
            }
        }
    }

    async fn handle_auth(&mut self, token: &str, message_id: &str) -> Option<CloseReason> {
        if self.auth.is_some() {
            self.reply_error(
                &GatewayError::InvalidMessage("already authenticated".to_string()),
                Some(message_id),
            );
            return None;
        }

        let result = match self.ctx.auth.verify(token).await {
            Ok(result) => result,
            Err(e) => {
                let retryable = e.retryable();
                self.try_send(server::auth_failed(e.code, &e.to_string(), retryable));
                if retryable {
                    // 可刷新的过期凭证：认证窗口内允许重试
                    debug!(connection_id = %self.connection_id, "retryable auth failure");
                    return None;
                }
                return Some(CloseReason::AuthFailed);
            }
        };

        // 会话记录写入失败时认证不得完成，否则其他实例无法路由到本连接
        let record = SessionRecord::new(
            &result.identity,
            &self.session_id,
            &self.ctx.config.gateway_id,
            &self.connection_id,
        );
        let store_timeout = Duration::from_millis(self.ctx.config.session.store_timeout_ms);
        let prior = match tokio::time::timeout(store_timeout, self.ctx.sessions.put(record)).await
        {
            Ok(Ok(prior)) => prior,
            Ok(Err(e)) => {
                warn!(connection_id = %self.connection_id, error = %e, "session write failed");
                self.reply_error(
                    &GatewayError::Unavailable("session store write failed".to_string()),
                    Some(message_id),
                );
                return None;
            }
            Err(_) => {
                warn!(connection_id = %self.connection_id, "session write timed out");
                self.reply_error(
                    &GatewayError::Unavailable("session store timeout".to_string()),
                    Some(message_id),
                );
                return None;
            }
        };

        // 旧会话由新登录负责通知其被顶替（异步尽力而为）
        if let Some(prior) = prior {
            info!(
                identity = %result.identity,
                old_connection = %prior.connection_id,
                "superseding previous session"
            );
            self.ctx.router.supersede(&prior).await;
        }

        if let Some(handle) = self.ctx.registry.get(&self.connection_id) {
            handle.bind_identity(&result.identity);
        }
        self.state = ConnectionState::Authenticated;
        let identity = result.identity.clone();
        let expires_at = result.expires_at;
        self.auth = Some(result);

        info!(
            connection_id = %self.connection_id,
            identity = %identity,
            "connection authenticated"
        );
        self.try_send(server::auth_success(
            message_id,
            &identity,
            &self.session_id,
            expires_at,
        ));

        // 离线期间积压的通知在认证完成后回放
        self.ctx
            .router
            .replay_offline(&identity, &self.connection_id)
            .await;
        None
    }

    async fn handle_subscribe(&mut self, channels: &[String], message_id: &str) {
        let Some(auth) = self.auth.as_ref() else {
            self.reply_error(&GatewayError::Unauthorized, Some(message_id));
            return;
        };

        let outcome = match self.ctx.subscriptions.subscribe(
            &self.connection_id,
            channels,
            &auth.permitted_channels,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.reply_error(&e, Some(message_id));
                return;
            }
        };

        self.ctx
            .router
            .sync_subscriptions(&outcome.newly_active, &[])
            .await;

        // 部分成功：确认集可为请求子集，被拒频道逐条报错
        for (channel, code) in &outcome.rejected {
            self.try_send(server::error(
                *code,
                &format!("channel rejected: {}", channel),
                Some(serde_json::json!({ "channel": channel })),
                Some(message_id),
            ));
        }
        self.try_send(server::subscribed(message_id, &outcome.confirmed));
    }

    async fn handle_unsubscribe(&mut self, channels: &[String], message_id: &str) {
        if self.auth.is_none() {
            self.reply_error(&GatewayError::Unauthorized, Some(message_id));
            return;
        }
        // 未订阅的频道视为幂等成功，静默处理
        let outcome = self.ctx.subscriptions.unsubscribe(&self.connection_id, channels);
        self.ctx
            .router
            .sync_subscriptions(&[], &outcome.deactivated)
            .await;
    }

    fn handle_ack(&mut self, notification_id: &str, message_id: &str) {
        if self.auth.is_none() {
            self.reply_error(&GatewayError::Unauthorized, Some(message_id));
            return;
        }
        // Unknown 不是错误：重复或迟到的 ack 直接容忍
        let outcome = self
            .ctx
            .tracker
            .record_ack(&self.connection_id, notification_id);
        debug!(
            connection_id = %self.connection_id,
            notification_id,
            ?outcome,
            "ack processed"
        );
    }

    /// 幂等拆除：删会话（仅当仍指向本连接）、释放订阅、冲刷未确认通知
    async fn close(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let from = self.state;
        self.state = ConnectionState::Closing;
        info!(connection_id = %self.connection_id, from = %from, ?reason, "connection closing");

        if let Some(auth) = self.auth.as_ref() {
            let store_timeout = Duration::from_millis(self.ctx.config.session.store_timeout_ms);
            match tokio::time::timeout(
                store_timeout,
                self.ctx
                    .sessions
                    .remove_if_current(&auth.identity, &self.connection_id),
            )
            .await
            {
                Ok(Ok(removed)) => {
                    debug!(
                        connection_id = %self.connection_id,
                        removed,
                        "session record cleanup"
                    );
                }
                Ok(Err(e)) => {
                    warn!(connection_id = %self.connection_id, error = %e, "session cleanup failed")
                }
                Err(_) => {
                    warn!(connection_id = %self.connection_id, "session cleanup timed out")
                }
            }
            self.ctx.limiter.forget(&auth.identity);
        }
        // 认证前限流桶以连接 ID 为键，未认证关闭也要释放
        self.ctx.limiter.forget(&self.connection_id);

        // 未确认的通知转入未送达处置，等待重连回放
        let flushed = self.ctx.tracker.flush_connection(&self.connection_id);
        for entry in flushed {
            if let Err(e) = self.ctx.offline.store(&entry.notification).await {
                warn!(
                    notification_id = %entry.notification.notification_id,
                    error = %e,
                    "failed to park undelivered notification"
                );
            } else {
                self.ctx.metrics.offline_stored_total.inc();
            }
        }

        let outcome = self.ctx.subscriptions.remove_connection(&self.connection_id);
        self.ctx
            .router
            .sync_subscriptions(&[], &outcome.deactivated)
            .await;

        self.ctx.registry.unregister(&self.connection_id);
        self.ctx
            .metrics
            .connections_active
            .set(self.ctx.registry.count() as i64);
        self.state = ConnectionState::Closed;
        info!(connection_id = %self.connection_id, "connection closed");
    }

    fn reply_error(&self, error: &GatewayError, original_message_id: Option<&str>) {
        let details = match error {
            GatewayError::RateLimited { retry_after_ms } => {
                Some(serde_json::json!({ "retry_after_ms": retry_after_ms }))
            }
            GatewayError::TooManyChannels { max } => Some(serde_json::json!({ "max": max })),
            GatewayError::MessageTooLarge { size, max } => {
                Some(serde_json::json!({ "size": size, "max": max }))
            }
            _ => None,
        };
        self.try_send(server::error(
            error.code(),
            &error.to_string(),
            details,
            original_message_id,
        ));
    }

    /// 出站队列写满时本连接即判定为慢客户端，由注册表路径断开；
    /// 这里对自身回复只做尽力投递
    fn try_send(&self, envelope: Envelope) {
        if self.outbound.try_send(envelope).is_err() {
            debug!(connection_id = %self.connection_id, "outbound queue full, reply dropped");
        }
    }
}
