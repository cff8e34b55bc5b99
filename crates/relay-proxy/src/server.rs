//! The seam between the proxy engine and inbound transports.
//!
//! The server crate implements this trait once per transport; the
//! controller only ever sees the trait object.

use async_trait::async_trait;
use relay_core::RelayResult;

/// Which inbound transport to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTransport {
    Stdio,
    Http { listen: String },
    Websocket { listen: String },
}

impl std::fmt::Display for InboundTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundTransport::Stdio => write!(f, "stdio"),
            InboundTransport::Http { listen } => write!(f, "http ({listen})"),
            InboundTransport::Websocket { listen } => write!(f, "ws ({listen})"),
        }
    }
}

/// One inbound server session.
#[async_trait]
pub trait InboundServer: Send + Sync {
    /// Start serving. Returns once the transport is running (bound, for
    /// network transports); serving continues in the background.
    async fn start(&self) -> RelayResult<()>;

    /// Stop serving. Idempotent, and safe to call when `start` never
    /// succeeded.
    async fn stop(&self);

    /// Re-announce the capability list to connected clients after the
    /// exposed set changed. Transports without a push channel ignore this.
    async fn refresh_capabilities(&self);

    /// Resolve when the session ends: stdin EOF for stdio, never for the
    /// network transports (their lifetime is the process's).
    async fn wait(&self);
}
