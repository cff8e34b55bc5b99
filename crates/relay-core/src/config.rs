//! Backend and proxy configuration records.
//!
//! These are the shapes handed to the controller by whatever loads the
//! configuration files; the controller treats them as immutable and
//! replaces them wholesale on a configuration update.

use crate::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How to reach one backend server.
///
/// Serialized with a `type` discriminator so config files and the cache can
/// round-trip it: `stdio`, `http`, `streamable-http`, or `websocket`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportDescriptor {
    /// A subprocess spoken to over its stdin/stdout pipes.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Plain JSON-RPC-over-HTTP-POST endpoint.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Streamable HTTP endpoint (SSE responses, session header).
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// WebSocket endpoint carrying JSON-RPC text frames.
    Websocket { url: String },
}

/// Static credentials attached to HTTP/WebSocket backend requests.
///
/// Interactive authorization flows are handled outside the proxy core; by
/// the time a config reaches the controller the token is already resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDescriptor {
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Configuration for one backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Unique, stable identifier; also the routing prefix in qualified names.
    pub id: String,
    /// Human-readable display name.
    #[serde(default)]
    pub name: String,
    pub transport: TransportDescriptor,
    /// Environment overrides applied on top of the transport's own `env`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auth: Option<AuthDescriptor>,
}

fn default_true() -> bool {
    true
}

impl BackendConfig {
    /// Validate invariants the rest of the engine relies on.
    ///
    /// Backend ids must be non-empty and must not contain `:`, which is
    /// reserved as the qualified-name separator.
    pub fn validate(&self) -> RelayResult<()> {
        if self.id.is_empty() {
            return Err(RelayError::Config("backend id must not be empty".into()));
        }
        if self.id.contains(':') {
            return Err(RelayError::Config(format!(
                "backend id '{}' must not contain ':'",
                self.id
            )));
        }
        Ok(())
    }
}

/// Timeout and retry settings shared by all downstream connections.
///
/// Live-updatable: the controller swaps these without tearing down running
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTimeouts {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_capabilities_timeout")]
    pub capabilities_timeout_seconds: u64,
    #[serde(default = "default_refresh_interval")]
    pub capabilities_refresh_interval_seconds: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_connect_attempts")]
    pub max_connect_attempts: u32,
}

fn default_request_timeout() -> u64 {
    30
}
fn default_capabilities_timeout() -> u64 {
    20
}
fn default_refresh_interval() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_connect_attempts() -> u32 {
    3
}

impl Default for ProxyTimeouts {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
            capabilities_timeout_seconds: default_capabilities_timeout(),
            capabilities_refresh_interval_seconds: default_refresh_interval(),
            connect_timeout_seconds: default_connect_timeout(),
            max_connect_attempts: default_connect_attempts(),
        }
    }
}

impl ProxyTimeouts {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
    pub fn capabilities_timeout(&self) -> Duration {
        Duration::from_secs(self.capabilities_timeout_seconds)
    }
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.capabilities_refresh_interval_seconds)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// The full backend configuration consumed by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub servers: Vec<BackendConfig>,
    #[serde(flatten)]
    pub timeouts: ProxyTimeouts,
}

impl ProxyConfig {
    pub fn validate(&self) -> RelayResult<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.id.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate backend id '{}'",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

/// Substitute `${NAME}` and `{NAME}` references in a string using `lookup`.
///
/// An unresolved reference is a configuration error, never a silent
/// empty-string substitution. Text that does not form a `NAME` identifier
/// (`[A-Za-z_][A-Za-z0-9_]*`) is left untouched.
pub fn substitute_env_with<F>(input: &str, lookup: F) -> RelayResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        let rest = &input[i..];
        let (prefix_len, dollar) = if rest.starts_with("${") {
            (2, true)
        } else if rest.starts_with('{') {
            (1, false)
        } else {
            match rest.chars().next() {
                Some(ch) => {
                    out.push(ch);
                    i += ch.len_utf8();
                    continue;
                }
                None => break,
            }
        };

        match parse_var_name(&rest[prefix_len..]) {
            Some(name) => {
                let value = lookup(name).ok_or_else(|| {
                    RelayError::Config(format!("unresolved environment variable '{name}'"))
                })?;
                out.push_str(&value);
                i += prefix_len + name.len() + 1;
            }
            None => {
                // Not a variable reference; emit verbatim.
                if dollar {
                    out.push('$');
                }
                out.push('{');
                i += prefix_len;
            }
        }
    }

    Ok(out)
}

/// Substitute environment references against the process environment.
pub fn substitute_env(input: &str) -> RelayResult<String> {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Parse a `NAME}` prefix, returning the name without the closing brace.
fn parse_var_name(rest: &str) -> Option<&str> {
    let end = rest.find('}')?;
    let name = &rest[..end];
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(name)
    } else {
        None
    }
}

/// Walk a JSON document and substitute environment references in every
/// string value. Used on parsed config files before typed deserialization.
pub fn resolve_env_in_value(value: &mut serde_json::Value) -> RelayResult<()> {
    resolve_with(value, &|name| std::env::var(name).ok())
}

/// As [`resolve_env_in_value`] but with an explicit lookup, for tests.
pub fn resolve_env_in_value_with<F>(value: &mut serde_json::Value, lookup: F) -> RelayResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    resolve_with(value, &lookup)
}

fn resolve_with<F>(value: &mut serde_json::Value, lookup: &F) -> RelayResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        serde_json::Value::String(s) => {
            *s = substitute_env_with(s, lookup)?;
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                resolve_with(item, lookup)?;
            }
        }
        serde_json::Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                resolve_with(v, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}
