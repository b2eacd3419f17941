//! 网关配置
//!
//! TOML 文件加载，环境变量覆盖关键项。所有分节均有默认值，
//! 缺省配置即可单实例（内存代理/内存会话存储）启动。

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ack::AckConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;

/// 认证相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// JWT 签名密钥
    pub token_secret: String,
    /// 握手后完成认证的时限（秒）
    pub auth_timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: "insecure-secret".to_string(),
            auth_timeout_secs: 5,
        }
    }
}

/// 连接与报文限制
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// 单连接最大订阅频道数
    pub max_channels: usize,
    /// 单条报文大小上限（字节）
    pub max_message_bytes: usize,
    /// 单连接出站队列深度，写满即判定慢客户端并断开
    pub outbound_queue: usize,
    /// 空闲超时（秒），窗口内无入站流量则关闭连接
    pub idle_timeout_secs: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_channels: 10,
            max_message_bytes: crate::protocol::MAX_MESSAGE_BYTES,
            outbound_queue: 64,
            idle_timeout_secs: 300,
        }
    }
}

/// 会话存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 会话记录 TTL（秒）
    pub ttl_seconds: u64,
    /// 存储调用超时（毫秒），超时按依赖不可用处理
    pub store_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            store_timeout_ms: 2000,
        }
    }
}

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// 实例标识，会话记录据此路由
    pub gateway_id: String,
    /// WebSocket 监听地址
    pub bind_addr: String,
    /// Redis 地址；为空时使用内存代理与内存会话存储（单实例模式）
    pub redis_url: Option<String>,
    pub auth: AuthConfig,
    pub limits: LimitConfig,
    pub session: SessionConfig,
    pub ack: AckConfig,
    pub rate_limit: RateLimitConfig,
    /// 代理发布/存储写入的重试策略
    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: format!("gw-{}", &Uuid::new_v4().to_string()[..8]),
            bind_addr: "0.0.0.0:8443".to_string(),
            redis_url: None,
            auth: AuthConfig::default(),
            limits: LimitConfig::default(),
            session: SessionConfig::default(),
            ack: AckConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl GatewayConfig {
    /// 从 TOML 文件加载，文件不存在时使用默认配置；随后应用环境变量覆盖
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path))?;
            toml::from_str(&raw)
                .with_context(|| format!("invalid config format: {}", path))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// 环境变量覆盖：部署环境注入的值优先于文件
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = env::var("PULSE_GATEWAY_ID") {
            self.gateway_id = id;
        }
        if let Ok(addr) = env::var("PULSE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(url) = env::var("PULSE_REDIS_URL") {
            self.redis_url = Some(url);
        }
        if let Ok(secret) = env::var("PULSE_TOKEN_SECRET") {
            self.auth.token_secret = secret;
        }
    }
}
