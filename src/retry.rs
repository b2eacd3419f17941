//! 有界指数退避重试
//!
//! 跨实例依赖（代理发布、会话存储写入）的统一重试策略。
//! 重试耗尽后错误上抛给调用方，绝不静默吞掉。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 计算第 `attempt` 次失败后的等待时长（指数退避 + 10% 抖动）
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32))
            .min(self.max_delay_ms as f64);
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        Duration::from_millis((base * jitter) as u64)
    }
}

/// 按策略重试执行异步操作
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt + 1 < policy.max_attempts {
                    let delay = policy.calculate_delay(attempt);
                    debug!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow::anyhow!("retry budget exhausted"))
        .context(format!("{}: max retries exceeded", operation)))
}
