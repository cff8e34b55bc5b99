//! Backend clients — one per transport — speaking the MCP JSON-RPC
//! protocol to a single backend server.
//!
//! Every transport sits behind the [`BackendClient`] trait so the proxy
//! engine can treat a subprocess, an HTTP endpoint, and a WebSocket
//! endpoint identically. Clients are not safe for concurrent multiplexed
//! use; the downstream connection layer serializes access.

pub mod http;
pub mod protocol;
pub mod stdio;
pub mod websocket;

pub use http::HttpClient;
pub use stdio::StdioClient;
pub use websocket::WebSocketClient;

use async_trait::async_trait;
use relay_core::{BackendConfig, CapabilitySet, RelayError, RelayResult, TransportDescriptor};

/// Wire-protocol client for exactly one backend.
///
/// `&mut self` throughout: one operation at a time is the contract, and the
/// borrow checker enforces it for direct users.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Establish the transport and perform the `initialize` handshake.
    /// Succeeds immediately when already connected.
    async fn connect(&mut self) -> RelayResult<()>;

    /// Best-effort teardown; never fails.
    async fn disconnect(&mut self);

    /// Query tools, prompts, and resources in one pass.
    async fn list_capabilities(&mut self) -> RelayResult<CapabilitySet>;

    /// Invoke a tool by its unqualified name.
    async fn call_tool(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> RelayResult<serde_json::Value>;

    /// Fetch a prompt by its unqualified name.
    async fn get_prompt(
        &mut self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> RelayResult<serde_json::Value>;

    /// Read a resource by its backend-local URI.
    async fn read_resource(&mut self, uri: &str) -> RelayResult<serde_json::Value>;
}

/// Build the client matching a backend's transport descriptor.
pub fn build_client(config: &BackendConfig) -> RelayResult<Box<dyn BackendClient>> {
    match &config.transport {
        TransportDescriptor::Stdio { command, args, env } => {
            let mut merged = env.clone();
            merged.extend(config.env.clone());
            Ok(Box::new(StdioClient::new(
                &config.id,
                command.clone(),
                args.clone(),
                merged,
            )))
        }
        TransportDescriptor::Http { url, headers } => Ok(Box::new(HttpClient::new(
            &config.id,
            url.clone(),
            headers.clone(),
            config.auth.clone(),
            false,
        )?)),
        TransportDescriptor::StreamableHttp { url, headers } => Ok(Box::new(HttpClient::new(
            &config.id,
            url.clone(),
            headers.clone(),
            config.auth.clone(),
            true,
        )?)),
        TransportDescriptor::Websocket { url } => {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(RelayError::Config(format!(
                    "backend '{}': websocket url must start with ws:// or wss://",
                    config.id
                )));
            }
            Ok(Box::new(WebSocketClient::new(
                &config.id,
                url.clone(),
                config.auth.clone(),
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_per_transport() {
        let json = r#"{"id":"s1","transport":{"type":"stdio","command":"mcp-fs"}}"#;
        let config: BackendConfig = serde_json::from_str(json).unwrap();
        assert!(build_client(&config).is_ok());

        let json = r#"{"id":"s2","transport":{"type":"http","url":"http://localhost:9000"}}"#;
        let config: BackendConfig = serde_json::from_str(json).unwrap();
        assert!(build_client(&config).is_ok());
    }

    #[test]
    fn test_build_client_rejects_bad_ws_url() {
        let json = r#"{"id":"s3","transport":{"type":"websocket","url":"http://nope"}}"#;
        let config: BackendConfig = serde_json::from_str(json).unwrap();
        assert!(build_client(&config).is_err());
    }
}
