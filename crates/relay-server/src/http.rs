//! HTTP inbound transport: JSON-RPC over `POST /mcp` plus a health probe.

use crate::rpc;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::{RelayError, RelayResult};
use relay_proxy::{Aggregator, InboundServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

pub struct HttpServer {
    aggregator: Arc<Aggregator>,
    listen: String,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    pub fn new(aggregator: Arc<Aggregator>, listen: impl Into<String>) -> Self {
        Self {
            aggregator,
            listen: listen.into(),
            local_addr: RwLock::new(None),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Address actually bound, available after `start` (useful when the
    /// configured port is 0).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    fn router(aggregator: Arc<Aggregator>) -> Router {
        Router::new()
            .route("/mcp", post(handle_rpc))
            .route("/health", get(handle_health))
            .with_state(aggregator)
    }
}

async fn handle_rpc(
    State(aggregator): State<Arc<Aggregator>>,
    body: String,
) -> impl IntoResponse {
    match rpc::dispatch_raw(&aggregator, &body).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        // Notifications are accepted without a body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn handle_health(State(aggregator): State<Arc<Aggregator>>) -> impl IntoResponse {
    let statuses = aggregator.statuses().await;
    let backends: Vec<serde_json::Value> = statuses
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "state": s.state.to_string(),
                "tools": s.tool_count
            })
        })
        .collect();
    Json(serde_json::json!({ "status": "ok", "backends": backends }))
}

#[async_trait]
impl InboundServer for HttpServer {
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

        let app = Self::router(self.aggregator.clone());
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "http server exited");
            }
        });
        *self.task.lock().await = Some(task);
        info!(%addr, "http server listening");
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
        // Request/response only; clients re-list on their own schedule.
    }

    async fn wait(&self) {
        std::future::pending::<()>().await;
    }
}
