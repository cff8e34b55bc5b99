//! Inbound JSON-RPC dispatcher, shared by every transport.
//!
//! Maps the MCP client surface (`initialize`, `ping`, the tool, prompt,
//! and resource methods) onto the aggregator and converts [`RelayError`]
//! values into JSON-RPC error objects. Notifications produce no response.

use relay_core::RelayError;
use relay_proxy::Aggregator;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Server-defined code for an operation that hit its deadline.
pub const TIMEOUT_ERROR: i64 = -32000;

/// Protocol revision the proxy advertises to inbound clients.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// One inbound JSON-RPC message. Ids are kept as raw JSON since clients
/// may use numbers or strings; an absent id marks a notification.
#[derive(Debug, Deserialize)]
pub struct InboundRequest {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

fn response(id: serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: serde_json::Value, code: i64, message: String) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

fn error_code(e: &RelayError) -> i64 {
    match e {
        RelayError::Routing(_) => INVALID_PARAMS,
        RelayError::Timeout(_) => TIMEOUT_ERROR,
        _ => INTERNAL_ERROR,
    }
}

/// Handle one raw inbound frame. Returns `None` when no response is owed
/// (notifications); malformed frames get a parse-error response with a
/// null id.
pub async fn dispatch_raw(aggregator: &Arc<Aggregator>, raw: &str) -> Option<serde_json::Value> {
    match serde_json::from_str::<InboundRequest>(raw) {
        Ok(request) => dispatch(aggregator, request).await,
        Err(e) => {
            warn!(error = %e, "undecodable inbound frame");
            Some(error_response(
                serde_json::Value::Null,
                PARSE_ERROR,
                format!("parse error: {e}"),
            ))
        }
    }
}

/// Handle one decoded inbound request.
pub async fn dispatch(
    aggregator: &Arc<Aggregator>,
    request: InboundRequest,
) -> Option<serde_json::Value> {
    let Some(id) = request.id else {
        debug!(method = %request.method, "inbound notification ignored");
        return None;
    };
    debug!(method = %request.method, "inbound request");

    let result = match request.method.as_str() {
        "initialize" => Ok(initialize_result()),
        "ping" => Ok(serde_json::json!({})),
        "tools/list" => Ok(serde_json::json!({ "tools": aggregator.list_tools().await })),
        "prompts/list" => Ok(serde_json::json!({ "prompts": aggregator.list_prompts().await })),
        "resources/list" => {
            Ok(serde_json::json!({ "resources": aggregator.list_resources().await }))
        }
        "tools/call" => call_tool(aggregator, request.params).await,
        "prompts/get" => get_prompt(aggregator, request.params).await,
        "resources/read" => read_resource(aggregator, request.params).await,
        other => {
            return Some(error_response(
                id,
                METHOD_NOT_FOUND,
                format!("method '{other}' is not supported"),
            ));
        }
    };

    Some(match result {
        Ok(value) => response(id, value),
        Err(e) => {
            warn!(method = %request.method, error = %e, "inbound request failed");
            error_response(id, error_code(&e), e.to_string())
        }
    })
}

fn initialize_result() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": true },
            "prompts": {},
            "resources": {}
        },
        "serverInfo": {
            "name": "mcp-relay",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

#[derive(Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<serde_json::Value>,
}

async fn call_tool(
    aggregator: &Arc<Aggregator>,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, RelayError> {
    let params: ToolCallParams = decode_params(params)?;
    let arguments = params.arguments.unwrap_or(serde_json::json!({}));
    aggregator.call_tool(&params.name, arguments).await
}

#[derive(Deserialize)]
struct GetPromptParams {
    name: String,
    #[serde(default)]
    arguments: Option<serde_json::Value>,
}

async fn get_prompt(
    aggregator: &Arc<Aggregator>,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, RelayError> {
    let params: GetPromptParams = decode_params(params)?;
    aggregator.get_prompt(&params.name, params.arguments).await
}

#[derive(Deserialize)]
struct ReadResourceParams {
    uri: String,
}

async fn read_resource(
    aggregator: &Arc<Aggregator>,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, RelayError> {
    let params: ReadResourceParams = decode_params(params)?;
    aggregator.read_resource(&params.uri).await
}

fn decode_params<T: serde::de::DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> Result<T, RelayError> {
    let params = params.ok_or_else(|| RelayError::Routing("missing params".into()))?;
    serde_json::from_value(params).map_err(|e| RelayError::Routing(format!("invalid params: {e}")))
}

/// The frame pushed to clients when the exposed tool list changed.
pub fn tools_list_changed_notification() -> serde_json::Value {
    serde_json::json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" })
}
