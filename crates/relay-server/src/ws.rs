//! WebSocket inbound transport.
//!
//! Each client gets its own socket; capability-change notifications are
//! fanned out to every connected client over a broadcast channel.

use crate::rpc;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use relay_core::{RelayError, RelayResult};
use relay_proxy::{Aggregator, InboundServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct WsState {
    aggregator: Arc<Aggregator>,
    announcements: broadcast::Sender<String>,
}

pub struct WebSocketServer {
    state: WsState,
    listen: String,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketServer {
    pub fn new(aggregator: Arc<Aggregator>, listen: impl Into<String>) -> Self {
        let (announcements, _) = broadcast::channel(16);
        Self {
            state: WsState {
                aggregator,
                announcements,
            },
            listen: listen.into(),
            local_addr: RwLock::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Address actually bound, available after `start`.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<String>(32);

    // One writer per client; responses and announcements share the sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let forward_tx = out_tx.clone();
    let mut announcements = state.announcements.subscribe();
    let forwarder = tokio::spawn(async move {
        loop {
            match announcements.recv().await {
                Ok(frame) => {
                    if forward_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "client missed announcements");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(response) = rpc::dispatch_raw(&state.aggregator, text.as_str()).await
                {
                    if out_tx.send(response.to_string()).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
    debug!("websocket client disconnected");
}

#[async_trait]
impl InboundServer for WebSocketServer {
    async fn start(&self) -> RelayResult<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen)
            .await
            .map_err(|e| RelayError::Connection(format!("bind {} failed: {e}", self.listen)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RelayError::Connection(format!("local addr unavailable: {e}")))?;
        *self.local_addr.write().await = Some(addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown.lock().await = Some(shutdown_tx);

        let app = Router::new()
            .route("/ws", get(handle_upgrade))
            .with_state(self.state.clone());
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "websocket server exited");
            }
        });
        *self.task.lock().await = Some(task);
        info!(%addr, "websocket server listening");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn refresh_capabilities(&self) {
        let frame = rpc::tools_list_changed_notification().to_string();
        match self.state.announcements.send(frame) {
            Ok(receivers) => debug!(receivers, "tool list change announced"),
            Err(_) => warn!("no websocket clients to announce to"),
        }
    }

    async fn wait(&self) {
        std::future::pending::<()>().await;
    }
}
