//! 送达追踪
//!
//! 记录已下发、未确认的通知，后台周期清扫过期条目。
//! 每个实例只清扫自己发出的通知：追踪条目只存在于发送时刻
//! 持有连接的实例内存中，无需分布式共识。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::metrics::GatewayMetrics;
use crate::protocol::{Notification, Priority};

/// 送达追踪配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    /// 各优先级的确认时限（秒）
    pub deadline_urgent_secs: u64,
    pub deadline_high_secs: u64,
    pub deadline_normal_secs: u64,
    pub deadline_low_secs: u64,
    /// 清扫间隔（毫秒）
    pub sweep_interval_ms: u64,
    /// 单条通知最大重投次数
    pub max_redeliveries: u32,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            deadline_urgent_secs: 15,
            deadline_high_secs: 30,
            deadline_normal_secs: 60,
            deadline_low_secs: 120,
            sweep_interval_ms: 1000,
            max_redeliveries: 3,
        }
    }
}

impl AckConfig {
    fn deadline_for(&self, priority: Priority) -> chrono::Duration {
        let secs = match priority {
            Priority::Urgent => self.deadline_urgent_secs,
            Priority::High => self.deadline_high_secs,
            Priority::Normal => self.deadline_normal_secs,
            Priority::Low => self.deadline_low_secs,
        };
        chrono::Duration::seconds(secs as i64)
    }
}

/// 一条已发送待确认的通知
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub notification: Notification,
    /// 发送时刻持有该通知的连接
    pub connection_id: String,
    pub sent_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// 已重投次数
    pub redeliveries: u32,
}

/// ack 处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// 成功关闭一条待确认通知
    Acked,
    /// 未知或已确认过的通知 ID（幂等，容忍重复与迟到）
    Unknown,
}

/// 过期通知的处置方
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn handle_expired(&self, expired: Vec<PendingNotification>);
}

/// 送达追踪器
pub struct DeliveryTracker {
    pending: DashMap<String, PendingNotification>,
    by_connection: DashMap<String, HashSet<String>>,
    config: AckConfig,
    metrics: Arc<GatewayMetrics>,
}

impl DeliveryTracker {
    pub fn new(config: AckConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            pending: DashMap::new(),
            by_connection: DashMap::new(),
            config,
            metrics,
        }
    }

    /// 记录一次下发
    pub fn record_sent(&self, connection_id: &str, notification: &Notification) {
        let now = Utc::now();
        let entry = PendingNotification {
            notification: notification.clone(),
            connection_id: connection_id.to_string(),
            sent_at: now,
            deadline: now + self.config.deadline_for(notification.priority),
            redeliveries: 0,
        };
        self.by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(notification.notification_id.clone());
        self.pending
            .insert(notification.notification_id.clone(), entry);
    }

    /// 记录一次重投，刷新时限并返回累计重投次数
    pub fn record_redelivery(&self, connection_id: &str, entry: &PendingNotification) -> u32 {
        let now = Utc::now();
        let redeliveries = entry.redeliveries + 1;
        let refreshed = PendingNotification {
            notification: entry.notification.clone(),
            connection_id: connection_id.to_string(),
            sent_at: now,
            deadline: now + self.config.deadline_for(entry.notification.priority),
            redeliveries,
        };
        self.by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(entry.notification.notification_id.clone());
        self.pending
            .insert(entry.notification.notification_id.clone(), refreshed);
        redeliveries
    }

    /// 处理客户端 ack，重复或未知 ID 返回 `Unknown` 而非错误
    pub fn record_ack(&self, connection_id: &str, notification_id: &str) -> AckOutcome {
        match self.pending.remove(notification_id) {
            Some((_, entry)) => {
                self.detach(&entry.connection_id, notification_id);
                self.metrics.acks_total.with_label_values(&["acked"]).inc();
                debug!(
                    notification_id,
                    connection_id, "notification acknowledged"
                );
                AckOutcome::Acked
            }
            None => {
                self.metrics.acks_total.with_label_values(&["unknown"]).inc();
                debug!(notification_id, connection_id, "ack for unknown notification");
                AckOutcome::Unknown
            }
        }
    }

    /// 摘出所有已过确认时限的条目
    pub fn sweep_expired(&self) -> Vec<PendingNotification> {
        let now = Utc::now();
        let expired_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                self.detach(&entry.connection_id, &id);
                expired.push(entry);
            }
        }
        if !expired.is_empty() {
            self.metrics
                .notifications_expired_total
                .inc_by(expired.len() as u64);
        }
        expired
    }

    /// 连接关闭时冲刷其全部未确认条目（转入未送达处置）
    pub fn flush_connection(&self, connection_id: &str) -> Vec<PendingNotification> {
        let mut flushed = Vec::new();
        if let Some((_, ids)) = self.by_connection.remove(connection_id) {
            for id in ids {
                if let Some((_, entry)) = self.pending.remove(&id) {
                    flushed.push(entry);
                }
            }
        }
        flushed
    }

    /// 连接当前未确认的通知数
    pub fn outstanding_for(&self, connection_id: &str) -> usize {
        self.by_connection
            .get(connection_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// 投递失败时撤销刚记录的条目（不计入 ack 指标）
    pub fn discard(&self, notification_id: &str) {
        if let Some((_, entry)) = self.pending.remove(notification_id) {
            self.detach(&entry.connection_id, notification_id);
        }
    }

    pub fn is_pending(&self, notification_id: &str) -> bool {
        self.pending.contains_key(notification_id)
    }

    pub fn max_redeliveries(&self) -> u32 {
        self.config.max_redeliveries
    }

    fn detach(&self, connection_id: &str, notification_id: &str) {
        if let Some(mut set) = self.by_connection.get_mut(connection_id) {
            set.remove(notification_id);
        }
    }
}

/// 启动后台清扫任务
pub fn start_sweeper(
    tracker: Arc<DeliveryTracker>,
    handler: Arc<dyn ExpiryHandler>,
) -> JoinHandle<()> {
    let mut ticker = interval(Duration::from_millis(tracker.config.sweep_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            let expired = tracker.sweep_expired();
            if !expired.is_empty() {
                warn!(count = expired.len(), "notifications passed ack deadline");
                handler.handle_expired(expired).await;
            }
        }
    })
}
