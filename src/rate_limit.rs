//! 限流器
//!
//! 按（身份, 报文类型）维度的令牌桶。桶状态仅驻留本实例内存，
//! 跨实例限流是近似的。拒绝本身不断开连接，只有持续违规超过
//! 粗粒度阈值才升级为强制断开。

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// 单类型限流规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRule {
    /// 桶容量
    pub capacity: f64,
    /// 每秒补充令牌数
    pub refill_per_sec: f64,
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 各报文类型的规则，未配置的类型使用 `default_rule`
    pub rules: HashMap<String, RateRule>,
    /// 兜底规则
    pub default_rule: RateRule,
    /// 连续拒绝达到该次数后升级为强制断开
    pub disconnect_after_denials: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut rules = HashMap::new();
        // 低频控制面报文
        rules.insert("auth".to_string(), RateRule { capacity: 3.0, refill_per_sec: 0.2 });
        rules.insert("subscribe".to_string(), RateRule { capacity: 5.0, refill_per_sec: 0.5 });
        rules.insert("unsubscribe".to_string(), RateRule { capacity: 5.0, refill_per_sec: 0.5 });
        // 高频 ack / 心跳
        rules.insert("ack".to_string(), RateRule { capacity: 120.0, refill_per_sec: 60.0 });
        rules.insert("ping".to_string(), RateRule { capacity: 30.0, refill_per_sec: 1.0 });
        Self {
            rules,
            default_rule: RateRule { capacity: 10.0, refill_per_sec: 1.0 },
            disconnect_after_denials: 20,
        }
    }
}

/// 消费结果
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    /// 放行
    Allowed,
    /// 拒绝，附建议重试等待时长
    Denied { retry_after: Duration },
    /// 持续违规，升级为强制断开
    Escalate,
}

/// 令牌桶
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_update: Instant,
    denials: u32,
}

impl TokenBucket {
    fn new(rule: &RateRule) -> Self {
        Self {
            tokens: rule.capacity,
            capacity: rule.capacity,
            refill_rate: rule.refill_per_sec,
            last_update: Instant::now(),
            denials: 0,
        }
    }

    /// 先按流逝时间补充令牌，再尝试消费一枚
    fn try_consume(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.denials = 0;
            Ok(())
        } else {
            self.denials += 1;
            let deficit = 1.0 - self.tokens;
            let wait = if self.refill_rate > 0.0 {
                deficit / self.refill_rate
            } else {
                f64::MAX
            };
            Err(Duration::from_millis((wait * 1000.0).ceil().min(60_000.0) as u64))
        }
    }
}

/// 限流器
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// 消费一枚（identity, kind）令牌
    pub fn consume(&self, identity: &str, kind: &str) -> RateDecision {
        let rule = self
            .config
            .rules
            .get(kind)
            .unwrap_or(&self.config.default_rule);
        let key = format!("{}:{}", kind, identity);
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(rule));

        match bucket.try_consume() {
            Ok(()) => RateDecision::Allowed,
            Err(retry_after) => {
                debug!(identity, kind, denials = bucket.denials, "rate limit exceeded");
                if bucket.denials >= self.config.disconnect_after_denials {
                    RateDecision::Escalate
                } else {
                    RateDecision::Denied { retry_after }
                }
            }
        }
    }

    /// 连接关闭后释放该主体的桶
    ///
    /// 认证前的桶以连接 ID 为键，认证后以身份为键，关闭路径
    /// 对两类键都要调用，否则未认证连接的桶会永久残留。
    pub fn forget(&self, identity: &str) {
        self.buckets
            .retain(|key, _| !key.ends_with(&format!(":{}", identity)));
    }

    /// 是否仍为该主体保留桶（测试观测用）
    #[cfg(test)]
    pub(crate) fn is_tracking(&self, identity: &str) -> bool {
        let suffix = format!(":{}", identity);
        self.buckets.iter().any(|entry| entry.key().ends_with(&suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: f64, refill: f64) -> RateLimiter {
        let mut config = RateLimitConfig::default();
        config
            .rules
            .insert("subscribe".to_string(), RateRule { capacity, refill_per_sec: refill });
        RateLimiter::new(config)
    }

    #[tokio::test]
    async fn test_limit_then_denied_with_positive_retry_after() {
        let limiter = limiter(3.0, 0.5);
        for _ in 0..3 {
            assert_eq!(limiter.consume("u1", "subscribe"), RateDecision::Allowed);
        }
        match limiter.consume("u1", "subscribe") {
            RateDecision::Denied { retry_after } => assert!(retry_after > Duration::ZERO),
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_over_time() {
        let limiter = limiter(1.0, 1.0);
        assert_eq!(limiter.consume("u1", "subscribe"), RateDecision::Allowed);
        assert!(matches!(
            limiter.consume("u1", "subscribe"),
            RateDecision::Denied { .. }
        ));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.consume("u1", "subscribe"), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_identities_do_not_share_buckets() {
        let limiter = limiter(1.0, 0.1);
        assert_eq!(limiter.consume("u1", "subscribe"), RateDecision::Allowed);
        assert_eq!(limiter.consume("u2", "subscribe"), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_forget_releases_buckets() {
        let limiter = limiter(1.0, 0.1);
        assert_eq!(limiter.consume("conn-abc", "subscribe"), RateDecision::Allowed);
        assert_eq!(limiter.consume("conn-abc", "ping"), RateDecision::Allowed);
        assert!(limiter.is_tracking("conn-abc"));

        limiter.forget("conn-abc");
        assert!(!limiter.is_tracking("conn-abc"));
    }

    #[tokio::test]
    async fn test_escalate_after_repeated_denials() {
        let mut config = RateLimitConfig::default();
        config
            .rules
            .insert("subscribe".to_string(), RateRule { capacity: 1.0, refill_per_sec: 0.0 });
        config.disconnect_after_denials = 3;
        let limiter = RateLimiter::new(config);

        assert_eq!(limiter.consume("u1", "subscribe"), RateDecision::Allowed);
        let mut last = RateDecision::Allowed;
        for _ in 0..3 {
            last = limiter.consume("u1", "subscribe");
        }
        assert_eq!(last, RateDecision::Escalate);
    }
}
