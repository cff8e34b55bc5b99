//! Core types shared across the mcp-relay crates.
//!
//! This crate provides the foundational types the proxy engine is built
//! from: the unified error enum, backend and transport configuration,
//! capability descriptors, and the preset model that decides which backend
//! capabilities are exposed to the inbound caller.

pub mod capability;
pub mod config;
pub mod preset;

pub use capability::{CapabilitySet, PromptDescriptor, ResourceDescriptor, ToolDescriptor};
pub use config::{
    resolve_env_in_value, substitute_env, AuthDescriptor, BackendConfig, ProxyConfig,
    ProxyTimeouts, TransportDescriptor,
};
pub use preset::{Preset, PromptReference, ResourceReference, ToolReference, EMPTY_PRESET_ID};

/// Top-level error type for the relay.
///
/// The first four variants map onto the failure classes callers need to
/// distinguish: a backend that could not be reached, an established
/// connection that broke, a backend that answered with garbage, and an
/// operation that outlived its configured bound.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A backend connection could not be established or maintained.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Low-level I/O failure on an established backend connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend returned a malformed or protocol-violating response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An operation exceeded its configured time bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An inbound call could not be mapped to a backend.
    #[error("Routing error: {0}")]
    Routing(String),

    /// Invalid or unresolvable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether this error is a per-operation timeout rather than a
    /// connection-level fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Timeout(_))
    }
}

/// A convenience `Result` alias using [`RelayError`].
pub type RelayResult<T> = Result<T, RelayError>;
