//! One backend, one connection, one execution lane.
//!
//! A [`DownstreamConnection`] wraps a [`BackendClient`] and guarantees that
//! only one operation against that backend is in flight at a time: every
//! operation takes the client mutex for its full duration, so a second
//! concurrent invocation queues behind the first instead of interleaving.
//! Pipe-based subprocesses in particular are not safe for multiplexed use.

use crate::backoff::BackoffPolicy;
use relay_cache::{CacheEntry, CapabilityCache};
use relay_client::BackendClient;
use relay_core::{BackendConfig, CapabilitySet, ProxyTimeouts, RelayError, RelayResult};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Lifecycle state of one downstream connection.
///
/// `Error` is not terminal: a subsequent `connect` may retry out of it.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error(String),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Starting => write!(f, "starting"),
            ConnectionState::Running => write!(f, "running"),
            ConnectionState::Stopping => write!(f, "stopping"),
            ConnectionState::Stopped => write!(f, "stopped"),
            ConnectionState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Timeout and retry settings, shared by every connection and live-updatable
/// without tearing connections down.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    pub timeouts: ProxyTimeouts,
    pub backoff: BackoffPolicy,
}

/// Handle through which the controller updates settings for all connections.
pub type SharedSettings = Arc<RwLock<ConnectionSettings>>;

/// Point-in-time summary of one connection, for status surfaces.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    pub tool_count: usize,
}

/// Last successfully fetched capability set.
///
/// `fetched_at` is `None` for snapshots seeded from the disk cache: their
/// age is unknown, so they never count as fresh but still serve as the
/// stale fallback.
struct Snapshot {
    set: CapabilitySet,
    fetched_at: Option<Instant>,
}

/// Owns one [`BackendClient`] plus its state machine, retries, and timeouts.
pub struct DownstreamConnection {
    config: BackendConfig,
    client: Mutex<Box<dyn BackendClient>>,
    state: RwLock<ConnectionState>,
    snapshot: RwLock<Option<Snapshot>>,
    settings: SharedSettings,
    cache: Option<Arc<CapabilityCache>>,
}

impl DownstreamConnection {
    pub fn new(
        config: BackendConfig,
        client: Box<dyn BackendClient>,
        settings: SharedSettings,
        cache: Option<Arc<CapabilityCache>>,
    ) -> Self {
        Self {
            config,
            client: Mutex::new(client),
            state: RwLock::new(ConnectionState::Stopped),
            snapshot: RwLock::new(None),
            settings,
            cache,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> ConnectionStatus {
        let tool_count = self
            .snapshot
            .read()
            .await
            .as_ref()
            .map(|s| s.set.tools.len())
            .unwrap_or(0);
        ConnectionStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            state: self.state().await,
            tool_count,
        }
    }

    /// Install a capability set recovered from the disk cache.
    ///
    /// Seeded snapshots are never fresh; the first `get_capabilities` still
    /// attempts a live query.
    pub async fn seed_capabilities(&self, set: CapabilitySet) {
        let mut snapshot = self.snapshot.write().await;
        if snapshot.is_none() {
            *snapshot = Some(Snapshot {
                set,
                fetched_at: None,
            });
        }
    }

    /// Capability set currently held in memory, fresh or stale.
    pub async fn cached_capabilities(&self) -> Option<CapabilitySet> {
        self.snapshot.read().await.as_ref().map(|s| s.set.clone())
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn record_failure(&self, error: &RelayError) {
        // Timeouts fail the one operation, not the connection.
        if error.is_timeout() {
            return;
        }
        let mut state = self.state.write().await;
        if !matches!(*state, ConnectionState::Error(_)) {
            *state = ConnectionState::Error(error.to_string());
        }
    }

    /// Establish the backend connection, retrying with backoff.
    ///
    /// Idempotent: succeeds immediately when already running. Each attempt
    /// is bounded by the connect timeout; a timed-out attempt counts as a
    /// failed one. Fails only after the configured attempts are exhausted.
    pub async fn connect(&self) -> RelayResult<()> {
        let mut client = self.client.lock().await;
        if *self.state.read().await == ConnectionState::Running {
            return Ok(());
        }
        self.set_state(ConnectionState::Starting).await;

        let (connect_timeout, max_attempts, backoff) = {
            let settings = self.settings.read().await;
            (
                settings.timeouts.connect_timeout(),
                settings.timeouts.max_connect_attempts.max(1),
                settings.backoff,
            )
        };

        let mut last_err = RelayError::Connection("no connect attempt made".into());
        for attempt in 1..=max_attempts {
            match tokio::time::timeout(connect_timeout, client.connect()).await {
                Ok(Ok(())) => {
                    self.set_state(ConnectionState::Running).await;
                    info!(backend = %self.config.id, attempt, "backend connected");
                    return Ok(());
                }
                Ok(Err(e)) => last_err = e,
                Err(_) => {
                    last_err = RelayError::Timeout(format!(
                        "connect attempt exceeded {}ms",
                        connect_timeout.as_millis()
                    ));
                }
            }
            // A failed attempt can leave the transport half-open.
            client.disconnect().await;
            warn!(
                backend = %self.config.id,
                attempt,
                max_attempts,
                error = %last_err,
                "backend connect attempt failed"
            );
            if attempt < max_attempts {
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
            }
        }

        self.set_state(ConnectionState::Error(last_err.to_string()))
            .await;
        Err(RelayError::Connection(format!(
            "failed to connect backend '{}' after {} attempts: {}",
            self.config.id, max_attempts, last_err
        )))
    }

    /// Best-effort teardown; always ends `Stopped` and never raises.
    pub async fn disconnect(&self) {
        let mut client = self.client.lock().await;
        self.set_state(ConnectionState::Stopping).await;
        client.disconnect().await;
        self.set_state(ConnectionState::Stopped).await;
        info!(backend = %self.config.id, "backend disconnected");
    }

    /// Fetch the backend's capabilities, serving the in-memory snapshot
    /// while it is fresh and falling back to it (stale allowed) when a live
    /// query fails. Propagates the failure only when nothing cached exists.
    pub async fn get_capabilities(&self, force_refresh: bool) -> RelayResult<CapabilitySet> {
        let mut client = self.client.lock().await;
        let (caps_timeout, refresh_interval) = {
            let settings = self.settings.read().await;
            (
                settings.timeouts.capabilities_timeout(),
                settings.timeouts.refresh_interval(),
            )
        };

        if !force_refresh {
            if let Some(snapshot) = &*self.snapshot.read().await {
                let fresh = snapshot
                    .fetched_at
                    .is_some_and(|at| at.elapsed() < refresh_interval);
                if fresh {
                    return Ok(snapshot.set.clone());
                }
            }
        }

        let result = self
            .bounded(caps_timeout, "capability fetch", client.list_capabilities())
            .await;

        match result {
            Ok(set) => {
                *self.snapshot.write().await = Some(Snapshot {
                    set: set.clone(),
                    fetched_at: Some(Instant::now()),
                });
                if let Some(cache) = &self.cache {
                    cache.save(&CacheEntry::now(&self.config.id, set.clone())).await;
                }
                Ok(set)
            }
            Err(e) => {
                if let Some(snapshot) = &*self.snapshot.read().await {
                    warn!(
                        backend = %self.config.id,
                        error = %e,
                        "capability fetch failed, serving cached set"
                    );
                    return Ok(snapshot.set.clone());
                }
                Err(e)
            }
        }
    }

    /// Invoke a tool. Live only, bounded by the call timeout; never retried
    /// here — retry policy for calls belongs to the caller.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> RelayResult<serde_json::Value> {
        let mut client = self.client.lock().await;
        let timeout = self.settings.read().await.timeouts.request_timeout();
        self.bounded(timeout, "tools/call", client.call_tool(name, arguments))
            .await
    }

    /// Fetch a prompt under the call timeout.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> RelayResult<serde_json::Value> {
        let mut client = self.client.lock().await;
        let timeout = self.settings.read().await.timeouts.request_timeout();
        self.bounded(timeout, "prompts/get", client.get_prompt(name, arguments))
            .await
    }

    /// Read a resource under the call timeout.
    pub async fn read_resource(&self, uri: &str) -> RelayResult<serde_json::Value> {
        let mut client = self.client.lock().await;
        let timeout = self.settings.read().await.timeouts.request_timeout();
        self.bounded(timeout, "resources/read", client.read_resource(uri))
            .await
    }

    /// Run one operation under a timeout, recording non-timeout failures in
    /// the connection state.
    async fn bounded<T>(
        &self,
        timeout: Duration,
        what: &str,
        op: impl Future<Output = RelayResult<T>>,
    ) -> RelayResult<T> {
        match tokio::time::timeout(timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.record_failure(&e).await;
                Err(e)
            }
            Err(_) => Err(RelayError::Timeout(format!(
                "{what} exceeded {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::{ToolDescriptor, TransportDescriptor};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn test_config(id: &str) -> BackendConfig {
        BackendConfig {
            id: id.to_string(),
            name: id.to_string(),
            transport: TransportDescriptor::Websocket {
                url: "ws://unused".to_string(),
            },
            env: Default::default(),
            enabled: true,
            auth: None,
        }
    }

    fn fast_settings() -> SharedSettings {
        let timeouts: ProxyTimeouts = serde_json::from_str("{}").unwrap();
        Arc::new(RwLock::new(ConnectionSettings {
            timeouts,
            backoff: BackoffPolicy {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(2),
                factor: 2.0,
            },
        }))
    }

    fn caps(tool: &str) -> CapabilitySet {
        CapabilitySet {
            tools: vec![ToolDescriptor {
                name: tool.to_string(),
                description: None,
                input_schema: None,
                output_schema: None,
            }],
            prompts: vec![],
            resources: vec![],
        }
    }

    /// Scriptable backend stub. Fails if two operations ever overlap.
    struct StubClient {
        connects: Arc<AtomicUsize>,
        fail_connects: usize,
        list_result: Arc<dyn Fn() -> RelayResult<CapabilitySet> + Send + Sync>,
        in_flight: Arc<AtomicBool>,
        op_delay: Duration,
    }

    impl StubClient {
        fn new() -> Self {
            Self {
                connects: Arc::new(AtomicUsize::new(0)),
                fail_connects: 0,
                list_result: Arc::new(|| Ok(CapabilitySet::default())),
                in_flight: Arc::new(AtomicBool::new(false)),
                op_delay: Duration::ZERO,
            }
        }

        async fn guard_entry(&self) {
            assert!(
                !self.in_flight.swap(true, Ordering::SeqCst),
                "operation entered re-entrantly"
            );
            if !self.op_delay.is_zero() {
                tokio::time::sleep(self.op_delay).await;
            }
        }

        fn guard_exit(&self) {
            self.in_flight.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BackendClient for StubClient {
        async fn connect(&mut self) -> RelayResult<()> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_connects {
                return Err(RelayError::Connection(format!("scripted failure {n}")));
            }
            Ok(())
        }

        async fn disconnect(&mut self) {}

        async fn list_capabilities(&mut self) -> RelayResult<CapabilitySet> {
            self.guard_entry().await;
            let result = (self.list_result)();
            self.guard_exit();
            result
        }

        async fn call_tool(
            &mut self,
            name: &str,
            _arguments: serde_json::Value,
        ) -> RelayResult<serde_json::Value> {
            self.guard_entry().await;
            self.guard_exit();
            Ok(serde_json::json!({"echo": name}))
        }

        async fn get_prompt(
            &mut self,
            name: &str,
            _arguments: Option<serde_json::Value>,
        ) -> RelayResult<serde_json::Value> {
            Ok(serde_json::json!({"prompt": name}))
        }

        async fn read_resource(&mut self, uri: &str) -> RelayResult<serde_json::Value> {
            Ok(serde_json::json!({"uri": uri}))
        }
    }

    fn connection(stub: StubClient) -> DownstreamConnection {
        DownstreamConnection::new(test_config("s1"), Box::new(stub), fast_settings(), None)
    }

    #[tokio::test]
    async fn test_connect_transitions_to_running() {
        let conn = connection(StubClient::new());
        assert_eq!(conn.state().await, ConnectionState::Stopped);
        conn.connect().await.unwrap();
        assert_eq!(conn.state().await, ConnectionState::Running);
    }

    #[tokio::test]
    async fn test_connect_idempotent_when_running() {
        let stub = StubClient::new();
        let connects = stub.connects.clone();
        let conn = connection(stub);

        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        // The second connect must not re-invoke the transport.
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_retries_until_success() {
        let mut stub = StubClient::new();
        stub.fail_connects = 2;
        let connects = stub.connects.clone();
        let conn = connection(stub);

        conn.connect().await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(conn.state().await, ConnectionState::Running);
    }

    #[tokio::test]
    async fn test_connect_exhaustion_is_connection_error() {
        let mut stub = StubClient::new();
        stub.fail_connects = 100;
        let conn = connection(stub);

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
        assert!(err.to_string().contains("scripted failure"), "carries last cause: {err}");
        assert!(matches!(conn.state().await, ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_error_state_not_terminal() {
        let mut stub = StubClient::new();
        stub.fail_connects = 3; // exactly the attempt budget
        let conn = connection(stub);

        assert!(conn.connect().await.is_err());
        conn.connect().await.unwrap();
        assert_eq!(conn.state().await, ConnectionState::Running);
    }

    #[tokio::test]
    async fn test_disconnect_always_ends_stopped() {
        let conn = connection(StubClient::new());
        conn.connect().await.unwrap();
        conn.disconnect().await;
        assert_eq!(conn.state().await, ConnectionState::Stopped);
        conn.disconnect().await;
        assert_eq!(conn.state().await, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_capabilities_cached_within_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut stub = StubClient::new();
        stub.list_result = Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(caps("t1"))
        });
        let conn = connection(stub);
        conn.connect().await.unwrap();

        conn.get_capabilities(false).await.unwrap();
        conn.get_capabilities(false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second fetch served from memory");

        conn.get_capabilities(true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2, "forced refresh goes live");
    }

    #[tokio::test]
    async fn test_stale_fallback_on_failed_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut stub = StubClient::new();
        stub.list_result = Arc::new(move || {
            if calls2.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(caps("t1"))
            } else {
                Err(RelayError::Transport("backend went away".into()))
            }
        });
        let conn = connection(stub);
        conn.connect().await.unwrap();

        let first = conn.get_capabilities(false).await.unwrap();
        let second = conn.get_capabilities(true).await.unwrap();
        assert_eq!(first, second, "failed forced refresh serves the stale set");
    }

    #[tokio::test]
    async fn test_fetch_failure_without_cache_propagates() {
        let mut stub = StubClient::new();
        stub.list_result = Arc::new(|| Err(RelayError::Transport("down".into())));
        let conn = connection(stub);
        conn.connect().await.unwrap();

        let err = conn.get_capabilities(false).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
        assert!(matches!(conn.state().await, ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_seeded_snapshot_is_stale_but_available() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut stub = StubClient::new();
        stub.list_result = Arc::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::Transport("down".into()))
        });
        let conn = connection(stub);
        conn.seed_capabilities(caps("from-disk")).await;
        conn.connect().await.unwrap();

        // Seeded snapshot is not fresh: a live query is attempted, fails,
        // and the seeded set is served.
        let set = conn.get_capabilities(false).await.unwrap();
        assert_eq!(set.tools[0].name, "from-disk");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_fetch_persists_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CapabilityCache::open(dir.path()).await.unwrap());

        let mut stub = StubClient::new();
        stub.list_result = Arc::new(|| Ok(caps("t1")));
        let conn = DownstreamConnection::new(
            test_config("s1"),
            Box::new(stub),
            fast_settings(),
            Some(cache.clone()),
        );
        conn.connect().await.unwrap();
        conn.get_capabilities(false).await.unwrap();

        let entry = cache.load("s1").await.unwrap();
        assert_eq!(entry.capabilities.tools[0].name, "t1");
    }

    #[tokio::test]
    async fn test_concurrent_calls_never_interleave() {
        let mut stub = StubClient::new();
        stub.op_delay = Duration::from_millis(20);
        let conn = Arc::new(connection(stub));
        conn.connect().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                conn.call_tool("t", serde_json::json!({})).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_call_timeout_leaves_state_untouched() {
        let timeouts: ProxyTimeouts =
            serde_json::from_str(r#"{"requestTimeoutSeconds":0}"#).unwrap();
        let settings = Arc::new(RwLock::new(ConnectionSettings {
            timeouts,
            backoff: BackoffPolicy::default(),
        }));
        let mut stub = StubClient::new();
        stub.op_delay = Duration::from_millis(50);
        let conn =
            DownstreamConnection::new(test_config("s1"), Box::new(stub), settings, None);
        conn.connect().await.unwrap();

        let err = conn.call_tool("slow", serde_json::json!({})).await.unwrap_err();
        assert!(err.is_timeout());
        // A timeout is an operation failure, not a connection fault.
        assert_eq!(conn.state().await, ConnectionState::Running);
    }
}
