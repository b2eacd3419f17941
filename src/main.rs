//! 网关进程入口
//!
//! 按配置装配存储/代理实现：配置了 Redis 时为多实例模式，
//! 否则退化为单实例内存模式（开发与测试用）。

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pulse_gateway::ack::{start_sweeper, DeliveryTracker};
use pulse_gateway::auth::JwtAuthGate;
use pulse_gateway::broker::{Broker, InMemoryBroker, InMemoryBus, RedisBroker};
use pulse_gateway::config::GatewayConfig;
use pulse_gateway::connection::{ConnectionContext, ConnectionRegistry};
use pulse_gateway::metrics::{GatewayMetrics, REGISTRY};
use pulse_gateway::offline::{InMemoryOfflineStore, OfflineStore, RedisOfflineStore};
use pulse_gateway::rate_limit::RateLimiter;
use pulse_gateway::router::EventRouter;
use pulse_gateway::server::GatewayServer;
use pulse_gateway::session::{InMemorySessionStore, RedisSessionStore, SessionStore};
use pulse_gateway::subscription::SubscriptionTable;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/gateway.toml".to_string());
    let config = Arc::new(GatewayConfig::load(&config_path)?);
    info!(gateway_id = %config.gateway_id, "starting pulse gateway");

    let metrics = Arc::new(GatewayMetrics::new(&REGISTRY)?);

    let sessions: Arc<dyn SessionStore>;
    let broker: Arc<dyn Broker>;
    let offline: Arc<dyn OfflineStore>;
    match &config.redis_url {
        Some(url) => {
            let client = Arc::new(redis::Client::open(url.as_str())?);
            sessions = Arc::new(
                RedisSessionStore::connect(client.clone(), config.session.ttl_seconds).await?,
            );
            broker = Arc::new(RedisBroker::connect(client.clone()).await?);
            offline =
                Arc::new(RedisOfflineStore::connect(client, config.session.ttl_seconds).await?);
            info!("connected to redis, multi-instance mode");
        }
        None => {
            info!("no redis configured, single-instance mode");
            sessions = Arc::new(InMemorySessionStore::new());
            broker = Arc::new(InMemoryBroker::new(InMemoryBus::new()));
            offline = Arc::new(InMemoryOfflineStore::new());
        }
    }

    let subscriptions = Arc::new(SubscriptionTable::new(config.limits.max_channels));
    let registry = Arc::new(ConnectionRegistry::new());
    let tracker = Arc::new(DeliveryTracker::new(config.ack.clone(), metrics.clone()));

    let router = Arc::new(EventRouter::new(
        &config.gateway_id,
        broker,
        sessions.clone(),
        subscriptions.clone(),
        registry.clone(),
        tracker.clone(),
        offline.clone(),
        config.retry.clone(),
        metrics.clone(),
    ));
    let router_task = router.start().await?;
    let sweeper_task = start_sweeper(tracker.clone(), router.clone());

    let auth = Arc::new(JwtAuthGate::new(config.auth.token_secret.as_bytes()));
    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let ctx = Arc::new(ConnectionContext {
        config,
        auth,
        sessions,
        subscriptions,
        router,
        tracker,
        limiter,
        registry,
        offline,
        metrics,
    });

    let server = GatewayServer::new(ctx);
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await?;

    sweeper_task.abort();
    router_task.abort();
    info!("gateway stopped");
    Ok(())
}
