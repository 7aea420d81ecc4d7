//! Bridge endpoint: a localhost WebSocket carrying build submissions and
//! storage RPC, plus a plain HTTP `GET /health` probe on the same port.
//!
//! Each connection gets its own outbound frame channel. Build results,
//! storage replies, and forwarded lifecycle events all flow through it and
//! are interleaved onto the socket by one `select!` loop — replies in
//! completion order, events in emission order.

use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientFrame, ErrorBody, Frame};
use crate::worker::BuildRequest;
use crate::AppContext;

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "bridge listening (WebSocket + HTTP health on same port)");

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    // Pinned so we can use it in the select! loop without moving.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping bridge");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("bridge stopped");
    Ok(())
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The daemon shares one port for both WebSocket and a plain HTTP health
/// endpoint so the editor's build pipeline can check liveness without a
/// WS library.
async fn handle_health_check(mut stream: tokio::net::TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request (we don't inspect it — any GET /health is fine).
    let mut req_buf = vec![0u8; 2048];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
        "activeBuilds": ctx.worker.in_flight(),
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Peek at the first bytes to distinguish HTTP health checks from
    // WebSocket upgrades — both share the port and both start with "GET ".
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    // One outbound channel per connection. The store adapter's dispatch
    // and event-forwarding tasks hold clones and stop once we drop ours
    // and the channel closes.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
    let (store_tx, store_rx) = mpsc::channel(64);
    ctx.store.rpc(store_rx, frame_tx.clone());

    loop {
        tokio::select! {
            // Incoming message from the editor
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Build(submit)) => {
                                ctx.worker.submit(BuildRequest {
                                    build: submit.build,
                                    run: submit.run,
                                    level: submit.level,
                                    reply_to: frame_tx.clone(),
                                }).await;
                            }
                            Ok(ClientFrame::Store(request)) => {
                                if store_tx.send(request).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(err = %e, "unparseable frame");
                                let frame = Frame::Error {
                                    id: Value::Null,
                                    error: ErrorBody {
                                        code: "ParseError".to_string(),
                                        message: format!("unrecognized frame: {e}"),
                                    },
                                };
                                if frame_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            // Outgoing frame: build result, RPC reply, or lifecycle event
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                let text = serde_json::to_string(&frame).unwrap_or_default();
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(err = %e, "send error");
                    break;
                }
            }
        }
    }
    Ok(())
}
