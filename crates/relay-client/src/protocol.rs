//! JSON-RPC 2.0 message types for the MCP wire protocol.

use relay_core::{CapabilitySet, RelayError, RelayResult};
use serde::{Deserialize, Serialize};

/// Protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Backend capability flags from the `initialize` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    #[serde(default)]
    pub resources: Option<serde_json::Value>,
    #[serde(default)]
    pub prompts: Option<serde_json::Value>,
}

/// `initialize` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Parameters for the `initialize` handshake request.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcp-relay",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Extract the `result` payload, converting a JSON-RPC error object into a
/// protocol error.
pub fn expect_result(resp: JsonRpcResponse) -> RelayResult<serde_json::Value> {
    if let Some(err) = resp.error {
        return Err(RelayError::Protocol(format!(
            "backend error {}: {}",
            err.code, err.message
        )));
    }
    resp.result
        .ok_or_else(|| RelayError::Protocol("response carries neither result nor error".into()))
}

/// Whether the response is a "method not found" rejection.
///
/// Backends that implement only the tool surface reject `prompts/list` /
/// `resources/list` this way; callers treat that as an empty list.
pub fn is_method_not_found(resp: &JsonRpcResponse) -> bool {
    resp.error.as_ref().is_some_and(|e| e.code == METHOD_NOT_FOUND)
}

/// Parse an array field of a list-response `result` into descriptors.
pub fn parse_listing<T: serde::de::DeserializeOwned>(
    result: serde_json::Value,
    key: &str,
) -> RelayResult<Vec<T>> {
    let items = result.get(key).cloned().unwrap_or(serde_json::json!([]));
    serde_json::from_value(items)
        .map_err(|e| RelayError::Protocol(format!("malformed '{key}' listing: {e}")))
}

/// Assemble a [`CapabilitySet`] from the three listing responses, treating
/// a "method not found" rejection of the prompt/resource listings as empty.
pub fn capability_set_from_listings(
    tools: JsonRpcResponse,
    prompts: JsonRpcResponse,
    resources: JsonRpcResponse,
) -> RelayResult<CapabilitySet> {
    let tools = parse_listing(expect_result(tools)?, "tools")?;
    let prompts = if is_method_not_found(&prompts) {
        Vec::new()
    } else {
        parse_listing(expect_result(prompts)?, "prompts")?
    };
    let resources = if is_method_not_found(&resources) {
        Vec::new()
    } else {
        parse_listing(expect_result(resources)?, "resources")?
    };
    Ok(CapabilitySet {
        tools,
        prompts,
        resources,
    })
}

/// Params for a `tools/call` request.
pub fn tool_call_params(name: &str, arguments: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "name": name, "arguments": arguments })
}

/// Params for a `prompts/get` request.
pub fn get_prompt_params(name: &str, arguments: Option<serde_json::Value>) -> serde_json::Value {
    match arguments {
        Some(args) => serde_json::json!({ "name": name, "arguments": args }),
        None => serde_json::json!({ "name": name }),
    }
}

/// Params for a `resources/read` request.
pub fn read_resource_params(uri: &str) -> serde_json::Value {
    serde_json::json!({ "uri": uri })
}
