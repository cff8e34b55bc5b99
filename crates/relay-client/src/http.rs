//! HTTP backend client — JSON-RPC 2.0 over HTTP POST.
//!
//! Covers both the plain `http` transport and the `streamable-http`
//! variant. The streaming variant answers with `text/event-stream` bodies
//! and correlates a session via the `Mcp-Session-Id` header; the plain
//! variant answers with a single JSON body. Both shapes are accepted on
//! every request, so a backend may upgrade its answers freely.

use crate::protocol::*;
use crate::BackendClient;
use async_trait::async_trait;
use relay_core::{AuthDescriptor, CapabilitySet, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const SESSION_HEADER: &str = "mcp-session-id";

/// Backend client for HTTP and streamable-HTTP MCP servers.
pub struct HttpClient {
    backend_id: String,
    url: String,
    headers: HashMap<String, String>,
    auth: Option<AuthDescriptor>,
    streaming: bool,
    client: reqwest::Client,
    session_id: Option<String>,
    next_id: AtomicU64,
    connected: bool,
}

impl HttpClient {
    pub fn new(
        backend_id: &str,
        url: String,
        headers: HashMap<String, String>,
        auth: Option<AuthDescriptor>,
        streaming: bool,
    ) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            backend_id: backend_id.to_string(),
            url,
            headers,
            auth,
            streaming,
            client,
            session_id: None,
            next_id: AtomicU64::new(1),
            connected: false,
        })
    }

    fn build_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(accept) = "application/json, text/event-stream".parse() {
            headers.insert(reqwest::header::ACCEPT, accept);
        }

        for (key, value) in &self.headers {
            insert_header(&mut headers, key, value);
        }
        if let Some(auth) = &self.auth {
            if let Some(token) = &auth.bearer_token {
                insert_header(&mut headers, "authorization", &format!("Bearer {token}"));
            }
            for (key, value) in &auth.headers {
                insert_header(&mut headers, key, value);
            }
        }
        if let Some(session) = &self.session_id {
            insert_header(&mut headers, SESSION_HEADER, session);
        }
        headers
    }

    async fn post(&mut self, body: serde_json::Value) -> RelayResult<reqwest::Response> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.build_headers())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    RelayError::Connection(format!("failed to reach '{}': {e}", self.url))
                } else if e.is_timeout() {
                    RelayError::Timeout(format!("HTTP request to '{}' timed out", self.url))
                } else {
                    RelayError::Transport(format!("HTTP request failed: {e}"))
                }
            })?;

        // The server may (re)issue a session id on any response.
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_string());
        }

        let status = response.status();
        if status.is_client_error() {
            return Err(RelayError::Protocol(format!(
                "backend rejected request with HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(RelayError::Transport(format!(
                "backend answered with HTTP {status}"
            )));
        }
        Ok(response)
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> RelayResult<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let response = self.post(serde_json::to_value(&req)?).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Transport(format!("failed to read response body: {e}")))?;

        if content_type.contains("text/event-stream") {
            return find_response_in_sse(&body, id).ok_or_else(|| {
                RelayError::Protocol(format!("no response for request {id} in event stream"))
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| RelayError::Protocol(format!("malformed JSON-RPC response: {e}")))
    }

    async fn notify(&mut self, method: &str, params: serde_json::Value) -> RelayResult<()> {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.post(msg).await.map(|_| ())
    }
}

fn insert_header(headers: &mut reqwest::header::HeaderMap, key: &str, value: &str) {
    match (
        reqwest::header::HeaderName::from_bytes(key.as_bytes()),
        reqwest::header::HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!(header = %key, "skipping invalid header"),
    }
}

/// Pull the data payloads out of a `text/event-stream` body.
///
/// Events are separated by blank lines; multiple `data:` lines accumulate
/// with newlines, and comment lines (leading `:`) are skipped.
fn parse_sse_data(body: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    for raw_event in body.split("\n\n") {
        let mut data = String::new();
        let mut has_data = false;
        for line in raw_event.lines() {
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                if has_data {
                    data.push('\n');
                }
                data.push_str(value.strip_prefix(' ').unwrap_or(value));
                has_data = true;
            }
        }
        if has_data {
            payloads.push(data);
        }
    }
    payloads
}

/// Find the JSON-RPC response matching `id` in an SSE body, falling back to
/// the first parseable response when the backend omits ids on its events.
fn find_response_in_sse(body: &str, id: u64) -> Option<JsonRpcResponse> {
    let mut first = None;
    for payload in parse_sse_data(body) {
        match serde_json::from_str::<JsonRpcResponse>(&payload) {
            Ok(resp) if resp.id == Some(id) => return Some(resp),
            Ok(resp) => {
                if first.is_none() && (resp.result.is_some() || resp.error.is_some()) {
                    first = Some(resp);
                }
            }
            Err(e) => debug!(error = %e, "skipping non-response SSE event"),
        }
    }
    first
}

#[async_trait]
impl BackendClient for HttpClient {
    async fn connect(&mut self) -> RelayResult<()> {
        if self.connected {
            return Ok(());
        }

        let init = self.request("initialize", Some(initialize_params())).await?;
        let result: InitializeResult = serde_json::from_value(expect_result(init)?)
            .map_err(|e| RelayError::Protocol(format!("malformed initialize result: {e}")))?;
        self.notify("notifications/initialized", serde_json::json!({}))
            .await?;

        self.connected = true;
        info!(
            backend = %self.backend_id,
            url = %self.url,
            streaming = self.streaming,
            version = %result.protocol_version,
            "http backend initialized"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        // Streamable-HTTP sessions are terminated with a DELETE; failures
        // only mean the server already forgot us.
        if self.streaming && self.session_id.is_some() {
            let result = self
                .client
                .delete(&self.url)
                .headers(self.build_headers())
                .send()
                .await;
            if let Err(e) = result {
                debug!(backend = %self.backend_id, error = %e, "session delete failed");
            }
        }
        self.session_id = None;
        info!(backend = %self.backend_id, "http backend disconnected");
    }

    async fn list_capabilities(&mut self) -> RelayResult<CapabilitySet> {
        if !self.connected {
            return Err(RelayError::Connection("not connected".into()));
        }
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
        if !self.connected {
            return Err(RelayError::Connection("not connected".into()));
        }
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
        if !self.connected {
            return Err(RelayError::Connection("not connected".into()));
        }
        let resp = self
            .request("prompts/get", Some(get_prompt_params(name, arguments)))
            .await?;
        expect_result(resp)
    }

    async fn read_resource(&mut self, uri: &str) -> RelayResult<serde_json::Value> {
        if !self.connected {
            return Err(RelayError::Connection("not connected".into()));
        }
        let resp = self
            .request("resources/read", Some(read_resource_params(uri)))
            .await?;
        expect_result(resp)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn json_response(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/json")
    }

    async fn mount_handshake(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "initialize"})))
            .respond_with(
                json_response(
                    r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"stub","version":"0"}}}"#,
                )
                .insert_header(SESSION_HEADER, "sess-1"),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(
                serde_json::json!({"method": "notifications/initialized"}),
            ))
            .respond_with(ResponseTemplate::new(202))
            .mount(server)
            .await;
    }

    async fn connected_client(server: &MockServer, streaming: bool) -> HttpClient {
        let mut client = HttpClient::new(
            "s1",
            server.uri(),
            HashMap::new(),
            None,
            streaming,
        )
        .unwrap();
        client.connect().await.unwrap();
        client
    }

    #[test]
    fn test_parse_sse_data_multiline_and_comments() {
        let body = ": comment\ndata: line1\ndata: line2\n\ndata: {\"x\":1}\n\n";
        let payloads = parse_sse_data(body);
        assert_eq!(payloads, vec!["line1\nline2".to_string(), "{\"x\":1}".to_string()]);
    }

    #[test]
    fn test_find_response_prefers_matching_id() {
        let body = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"id\":9,\"result\":\"other\"}\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":\"mine\"}\n\n"
        );
        let resp = find_response_in_sse(body, 2).unwrap();
        assert_eq!(resp.result, Some(serde_json::json!("mine")));
    }

    #[tokio::test]
    async fn test_connect_and_session_header_replay() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        // The listing request must carry the session id captured during
        // the handshake.
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "tools/list"})))
            .and(header(SESSION_HEADER, "sess-1"))
            .respond_with(json_response(
                r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[{"name":"a"}],"prompts":[],"resources":[]}}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "prompts/list"})))
            .respond_with(json_response(
                r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Method not found"}}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "resources/list"})))
            .respond_with(json_response(
                r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"Method not found"}}"#,
            ))
            .mount(&server)
            .await;

        let mut client = connected_client(&server, true).await;
        let caps = client.list_capabilities().await.unwrap();
        assert_eq!(caps.tools.len(), 1);
        assert!(caps.prompts.is_empty());
    }

    #[tokio::test]
    async fn test_sse_response_body() {
        let server = MockServer::start().await;
        mount_handshake(&server).await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"content\":[]}}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let mut client = connected_client(&server, true).await;
        let result = client.call_tool("a", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!({"content": []}));
    }

    #[tokio::test]
    async fn test_http_4xx_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut client =
            HttpClient::new("s1", server.uri(), HashMap::new(), None, false).unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_http_5xx_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut client =
            HttpClient::new("s1", server.uri(), HashMap::new(), None, false).unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connection_error() {
        let mut client = HttpClient::new(
            "s1",
            "http://127.0.0.1:1".to_string(),
            HashMap::new(),
            None,
            false,
        )
        .unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
    }

    #[tokio::test]
    async fn test_auth_headers_attached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer tok"))
            .and(header("x-extra", "1"))
            .and(body_partial_json(serde_json::json!({"method": "initialize"})))
            .respond_with(json_response(
                r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(
                serde_json::json!({"method": "notifications/initialized"}),
            ))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let auth = AuthDescriptor {
            bearer_token: Some("tok".to_string()),
            headers: HashMap::from([("x-extra".to_string(), "1".to_string())]),
        };
        let mut client =
            HttpClient::new("s1", server.uri(), HashMap::new(), Some(auth), false).unwrap();
        client.connect().await.unwrap();
    }
}
