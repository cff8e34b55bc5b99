//! Inbound transports: the client-facing side of the proxy.
//!
//! Three interchangeable servers (stdio, HTTP, WebSocket) expose the same
//! JSON-RPC surface over the aggregator via a shared dispatcher.

pub mod http;
pub mod rpc;
pub mod stdio;
pub mod ws;

#[cfg(test)]
mod testing;

use relay_proxy::{Aggregator, InboundServer, InboundTransport};
use std::sync::Arc;

pub use http::HttpServer;
pub use stdio::StdioServer;
pub use ws::WebSocketServer;

/// Build the inbound server for the selected transport.
pub fn create_server(
    transport: &InboundTransport,
    aggregator: Arc<Aggregator>,
) -> Arc<dyn InboundServer> {
    match transport {
        InboundTransport::Stdio => Arc::new(StdioServer::new(aggregator)),
        InboundTransport::Http { listen } => Arc::new(HttpServer::new(aggregator, listen.clone())),
        InboundTransport::Websocket { listen } => {
            Arc::new(WebSocketServer::new(aggregator, listen.clone()))
        }
    }
}
