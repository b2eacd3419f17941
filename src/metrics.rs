//! Prometheus 指标收集
//!
//! 网关各模块共享统一的全局 Registry。

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 网关指标
pub struct GatewayMetrics {
    /// 当前活跃连接数
    pub connections_active: IntGauge,
    /// 累计接受的连接数
    pub connections_total: IntCounter,
    /// 入站报文数（按类型）
    pub messages_in_total: IntCounterVec,
    /// 本地投递的通知数
    pub notifications_delivered_total: IntCounter,
    /// 过期未确认的通知数
    pub notifications_expired_total: IntCounter,
    /// ack 处理数（按结果）
    pub acks_total: IntCounterVec,
    /// 限流拒绝数
    pub rate_limited_total: IntCounter,
    /// 代理发布失败数（重试耗尽）
    pub broker_publish_failure_total: IntCounter,
    /// 转入离线回放路径的通知数
    pub offline_stored_total: IntCounter,
    /// 通知从产生到投递的耗时（秒）
    pub delivery_latency_seconds: Histogram,
}

impl GatewayMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let connections_active = IntGauge::new(
            "gateway_connections_active",
            "Number of currently open connections",
        )?;
        let connections_total = IntCounter::new(
            "gateway_connections_total",
            "Total number of accepted connections",
        )?;
        let messages_in_total = IntCounterVec::new(
            Opts::new("gateway_messages_in_total", "Inbound messages by type"),
            &["message_type"],
        )?;
        let notifications_delivered_total = IntCounter::new(
            "gateway_notifications_delivered_total",
            "Notifications delivered to local connections",
        )?;
        let notifications_expired_total = IntCounter::new(
            "gateway_notifications_expired_total",
            "Notifications that passed their ack deadline",
        )?;
        let acks_total = IntCounterVec::new(
            Opts::new("gateway_acks_total", "Processed acks by outcome"),
            &["outcome"],
        )?;
        let rate_limited_total = IntCounter::new(
            "gateway_rate_limited_total",
            "Messages rejected by the rate limiter",
        )?;
        let broker_publish_failure_total = IntCounter::new(
            "gateway_broker_publish_failure_total",
            "Broker publishes that failed after retries",
        )?;
        let offline_stored_total = IntCounter::new(
            "gateway_offline_stored_total",
            "Notifications handed to the offline replay path",
        )?;
        let delivery_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_delivery_latency_seconds",
                "Latency from notification creation to local delivery",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(messages_in_total.clone()))?;
        registry.register(Box::new(notifications_delivered_total.clone()))?;
        registry.register(Box::new(notifications_expired_total.clone()))?;
        registry.register(Box::new(acks_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(broker_publish_failure_total.clone()))?;
        registry.register(Box::new(offline_stored_total.clone()))?;
        registry.register(Box::new(delivery_latency_seconds.clone()))?;

        Ok(Self {
            connections_active,
            connections_total,
            messages_in_total,
            notifications_delivered_total,
            notifications_expired_total,
            acks_total,
            rate_limited_total,
            broker_publish_failure_total,
            offline_stored_total,
            delivery_latency_seconds,
        })
    }

    /// 测试用：挂在独立 Registry 上，避免重复注册冲突
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("metrics construction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = GatewayMetrics::new(&registry).unwrap();
        metrics.connections_total.inc();
        metrics.connections_active.set(3);
        assert_eq!(metrics.connections_total.get(), 1);

        // 同名指标重复注册应报错
        assert!(GatewayMetrics::new(&registry).is_err());
    }
}
