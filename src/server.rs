//! WebSocket 接入层
//!
//! 只做传输桥接：每个套接字拆成读写两半，读侧把文本帧喂给连接任务，
//! 写侧把连接任务的出站报文刷回套接字。协议语义全部在连接任务内，
//! 这里不解析报文内容。

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionActor, ConnectionContext, ControlSignal};

/// WebSocket 网关服务
pub struct GatewayServer {
    ctx: Arc<ConnectionContext>,
}

impl GatewayServer {
    pub fn new(ctx: Arc<ConnectionContext>) -> Self {
        Self { ctx }
    }

    /// 运行接入循环直到 `shutdown` 完成
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.ctx.config.bind_addr))?;
        let bound = listener.local_addr().context("failed reading bound address")?;
        info!(
            gateway_id = %self.ctx.config.gateway_id,
            addr = %bound,
            "gateway listening"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = self.ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_socket(ctx, stream, peer).await {
                                debug!(%peer, error = %e, "websocket session ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        info!("gateway shutting down, signaling connections");
        self.ctx
            .registry
            .broadcast(ControlSignal::Shutdown("server stopping".to_string()));
        Ok(())
    }
}

async fn handle_socket(
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .with_context(|| format!("websocket upgrade failed for {peer}"))?;
    let (mut write, mut read) = ws.split();

    let conn = ConnectionActor::spawn(ctx);
    debug!(connection_id = %conn.connection_id, %peer, "websocket session started");

    // 连接任务关闭并注销后所有出站发送端都会释放，写任务随之收尾
    let mut outbound = conn.outbound;
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            if write.send(Message::Text(envelope.encode())).await.is_err() {
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(connection_id = %conn.connection_id, error = %e, "websocket read error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if conn.inbound.send(text).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            // 协议只定义文本帧，二进制帧直接忽略
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    drop(conn.inbound);
    let _ = conn.join.await;
    let _ = writer.await;
    debug!(connection_id = %conn.connection_id, %peer, "websocket session ended");
    Ok(())
}
