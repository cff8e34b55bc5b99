//! WebSocket backend client — JSON-RPC 2.0 over text frames.

use crate::protocol::*;
use crate::BackendClient;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_core::{AuthDescriptor, CapabilitySet, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

struct LiveSocket {
    write: SplitSink<WsStream, Message>,
    pending: PendingMap,
    reader: tokio::task::JoinHandle<()>,
}

/// Backend client for WebSocket MCP servers.
pub struct WebSocketClient {
    backend_id: String,
    url: String,
    auth: Option<AuthDescriptor>,
    next_id: AtomicU64,
    live: Option<LiveSocket>,
}

impl WebSocketClient {
    pub fn new(backend_id: &str, url: String, auth: Option<AuthDescriptor>) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            url,
            auth,
            next_id: AtomicU64::new(1),
            live: None,
        }
    }

    fn client_request(&self) -> RelayResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Config(format!("invalid websocket url: {e}")))?;

        if let Some(auth) = &self.auth {
            let headers = request.headers_mut();
            if let Some(token) = &auth.bearer_token {
                if let Ok(value) = format!("Bearer {token}").parse() {
                    headers.insert("authorization", value);
                }
            }
            for (key, value) in &auth.headers {
                if let (Ok(name), Ok(value)) = (
                    key.parse::<tokio_tungstenite::tungstenite::http::HeaderName>(),
                    value.parse(),
                ) {
                    headers.insert(name, value);
                }
            }
        }
        Ok(request)
    }

    fn spawn_reader(
        backend_id: String,
        mut read: SplitStream<WsStream>,
        pending: PendingMap,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<JsonRpcResponse>(&text) {
                            Ok(resp) => {
                                if let Some(id) = resp.id {
                                    let mut map = pending.lock().await;
                                    if let Some(tx) = map.remove(&id) {
                                        let _ = tx.send(resp);
                                    }
                                }
                            }
                            Err(e) => {
                                debug!(backend = %backend_id, error = %e,
                                    "non-JSON-RPC frame from backend");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(backend = %backend_id, "backend closed websocket");
                        break;
                    }
                    Ok(_) => {} // ping/pong/binary
                    Err(e) => {
                        error!(backend = %backend_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
            pending.lock().await.clear();
        })
    }

    async fn send_frame(&mut self, payload: String) -> RelayResult<()> {
        let live = self
            .live
            .as_mut()
            .ok_or_else(|| RelayError::Connection("not connected".into()))?;
        live.write
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| RelayError::Transport(format!("websocket send failed: {e}")))
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> RelayResult<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_string(&req)?;

        let rx = {
            let live = self
                .live
                .as_ref()
                .ok_or_else(|| RelayError::Connection("not connected".into()))?;
            let (tx, rx) = oneshot::channel();
            let mut map = live.pending.lock().await;
            // A caller that gave up waiting leaves a dead sender behind.
            map.retain(|_, tx| !tx.is_closed());
            map.insert(id, tx);
            rx
        };

        if let Err(e) = self.send_frame(payload).await {
            if let Some(live) = &self.live {
                live.pending.lock().await.remove(&id);
            }
            return Err(e);
        }

        rx.await
            .map_err(|_| RelayError::Transport("backend closed before responding".into()))
    }

    async fn notify(&mut self, method: &str, params: serde_json::Value) -> RelayResult<()> {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.send_frame(msg.to_string()).await
    }
}

#[async_trait]
impl BackendClient for WebSocketClient {
    async fn connect(&mut self) -> RelayResult<()> {
        if self.live.is_some() {
            return Ok(());
        }

        let request = self.client_request()?;
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| {
                RelayError::Connection(format!("failed to reach '{}': {e}", self.url))
            })?;
        let (write, read) = stream.split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = Self::spawn_reader(self.backend_id.clone(), read, pending.clone());

        self.live = Some(LiveSocket {
            write,
            pending,
            reader,
        });

        let handshake = async {
            let init = self.request("initialize", Some(initialize_params())).await?;
            let result: InitializeResult = serde_json::from_value(expect_result(init)?)
                .map_err(|e| RelayError::Protocol(format!("malformed initialize result: {e}")))?;
            self.notify("notifications/initialized", serde_json::json!({}))
                .await?;
            Ok::<_, RelayError>(result)
        };
        let result = match handshake.await {
            Ok(result) => result,
            Err(e) => {
                self.disconnect().await;
                return Err(e);
            }
        };

        info!(
            backend = %self.backend_id,
            url = %self.url,
            version = %result.protocol_version,
            "websocket backend initialized"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut live) = self.live.take() {
            let _ = live.write.send(Message::Close(None)).await;
            live.reader.abort();
            live.pending.lock().await.clear();
            info!(backend = %self.backend_id, "websocket backend disconnected");
        }
    }

    async fn list_capabilities(&mut self) -> RelayResult<CapabilitySet> {
        let tools = self.request("tools/list", None).await?;
        let prompts = self.request("prompts/list", None).await?;
        let resources = self.request("resources/list", None).await?;
        capability_set_from_listings(tools, prompts, resources)
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> RelayResult<serde_json::Value> {
        let resp = self
            .request("tools/call", Some(tool_call_params(name, arguments)))
            .await?;
        expect_result(resp)
    }

    async fn get_prompt(
        &mut self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> RelayResult<serde_json::Value> {
        let resp = self
            .request("prompts/get", Some(get_prompt_params(name, arguments)))
            .await?;
        expect_result(resp)
    }

    async fn read_resource(&mut self, uri: &str) -> RelayResult<serde_json::Value> {
        let resp = self
            .request("resources/read", Some(read_resource_params(uri)))
            .await?;
        expect_result(resp)
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.reader.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let mut client =
            WebSocketClient::new("s1", "ws://127.0.0.1:1/mcp".to_string(), None);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut client = WebSocketClient::new("s1", "ws://127.0.0.1:1".to_string(), None);
        let err = client.list_capabilities().await.unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
    }

    #[test]
    fn test_auth_headers_on_client_request() {
        let auth = AuthDescriptor {
            bearer_token: Some("tok".to_string()),
            headers: HashMap::from([("x-extra".to_string(), "1".to_string())]),
        };
        let client = WebSocketClient::new("s1", "ws://localhost:9000/mcp".to_string(), Some(auth));
        let request = client.client_request().unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer tok");
        assert_eq!(request.headers()["x-extra"], "1");
    }
}
