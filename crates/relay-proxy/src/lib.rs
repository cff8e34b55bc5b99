//! The proxy engine: downstream connection lifecycle, capability
//! aggregation, call routing, and top-level control.
//!
//! Every backend gets one [`DownstreamConnection`] whose operations are
//! serialized onto a single execution lane; the [`Aggregator`] computes the
//! preset-filtered capability view and routes qualified calls; the
//! [`ProxyController`] owns both and applies configuration changes.

pub mod aggregator;
pub mod backoff;
pub mod connection;
pub mod controller;
pub mod server;

pub use aggregator::{qualify, split_qualified, AggregateView, Aggregator};
pub use backoff::BackoffPolicy;
pub use connection::{
    ConnectionSettings, ConnectionState, ConnectionStatus, DownstreamConnection, SharedSettings,
};
pub use controller::ProxyController;
pub use server::{InboundServer, InboundTransport};
