//! Top-level ownership: connections, aggregator, cache, inbound server.

use crate::aggregator::Aggregator;
use crate::connection::{ConnectionSettings, ConnectionStatus, DownstreamConnection, SharedSettings};
use crate::server::InboundServer;
use relay_cache::CapabilityCache;
use relay_client::build_client;
use relay_core::{BackendConfig, Preset, ProxyConfig, RelayResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Builds and owns the whole proxy: one connection per enabled backend,
/// the aggregator over them, the optional disk cache, and the inbound
/// server once one is attached.
pub struct ProxyController {
    aggregator: Arc<Aggregator>,
    settings: SharedSettings,
    cache: Option<Arc<CapabilityCache>>,
    backends: RwLock<HashMap<String, BackendConfig>>,
    server: RwLock<Option<Arc<dyn InboundServer>>>,
}

impl ProxyController {
    pub fn new(settings: ConnectionSettings, cache: Option<Arc<CapabilityCache>>) -> Self {
        Self {
            aggregator: Arc::new(Aggregator::new(Preset::empty())),
            settings: Arc::new(RwLock::new(settings)),
            cache,
            backends: RwLock::new(HashMap::new()),
            server: RwLock::new(None),
        }
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        self.aggregator.clone()
    }

    pub async fn attach_server(&self, server: Arc<dyn InboundServer>) {
        *self.server.write().await = Some(server);
    }

    /// Bring the proxy up: build a connection per enabled backend, seed
    /// snapshots from the disk cache, prune stale cache entries, connect
    /// every backend, and compute the first filtered view.
    ///
    /// A backend that fails to connect is logged and left in `Error`; the
    /// proxy starts with whatever did come up.
    pub async fn start(&self, config: &ProxyConfig, preset: Preset) -> RelayResult<()> {
        config.validate()?;
        {
            let mut settings = self.settings.write().await;
            settings.timeouts = config.timeouts;
        }
        self.aggregator.apply_preset(preset).await;

        let enabled: Vec<BackendConfig> = config
            .servers
            .iter()
            .filter(|b| b.enabled)
            .cloned()
            .collect();
        self.sync_backends(&enabled).await?;
        self.prune_cache().await;
        self.connect_all().await;
        self.aggregator.refresh_view(false).await;
        info!(backends = enabled.len(), "proxy started");
        Ok(())
    }

    /// Apply an edited backend configuration without a restart.
    ///
    /// Diffs by id and config equality: unchanged connections survive
    /// untouched, removed or changed ones are disconnected, new ones are
    /// built and connected. Timeout changes apply live to survivors.
    pub async fn apply_config(&self, config: &ProxyConfig) -> RelayResult<()> {
        config.validate()?;
        {
            let mut settings = self.settings.write().await;
            settings.timeouts = config.timeouts;
        }
        let enabled: Vec<BackendConfig> = config
            .servers
            .iter()
            .filter(|b| b.enabled)
            .cloned()
            .collect();
        self.sync_backends(&enabled).await?;
        self.prune_cache().await;
        self.connect_all().await;
        self.aggregator.refresh_view(false).await;
        self.announce().await;
        Ok(())
    }

    /// Swap the active preset and re-announce the exposed list.
    pub async fn apply_preset(&self, preset: Preset) {
        self.aggregator.apply_preset(preset).await;
        self.aggregator.refresh_view(false).await;
        self.announce().await;
    }

    /// Per-backend status for status surfaces.
    pub async fn statuses(&self) -> Vec<ConnectionStatus> {
        self.aggregator.statuses().await
    }

    /// Stop the inbound server, then disconnect every backend.
    pub async fn shutdown(&self) {
        if let Some(server) = self.server.read().await.clone() {
            server.stop().await;
        }
        for connection in self.aggregator.connections().await {
            connection.disconnect().await;
        }
        info!("proxy shut down");
    }

    /// Reconcile the connection set against the desired backend list.
    async fn sync_backends(&self, desired: &[BackendConfig]) -> RelayResult<()> {
        let mut known = self.backends.write().await;

        let desired_ids: Vec<&str> = desired.iter().map(|b| b.id.as_str()).collect();
        let dropped: Vec<String> = known
            .keys()
            .filter(|id| !desired_ids.contains(&id.as_str()))
            .cloned()
            .collect();
        for id in dropped {
            known.remove(&id);
            if let Some(connection) = self.aggregator.remove_connection(&id).await {
                connection.disconnect().await;
                info!(backend = %id, "backend removed");
            }
        }

        for backend in desired {
            if known.get(&backend.id) == Some(backend) {
                continue;
            }
            // Changed config: tear down the old connection first.
            if let Some(connection) = self.aggregator.remove_connection(&backend.id).await {
                connection.disconnect().await;
            }
            let client = build_client(backend)?;
            let connection = Arc::new(DownstreamConnection::new(
                backend.clone(),
                client,
                self.settings.clone(),
                self.cache.clone(),
            ));
            if let Some(cache) = &self.cache {
                if let Some(entry) = cache.load(&backend.id).await {
                    connection.seed_capabilities(entry.capabilities).await;
                }
            }
            self.aggregator.insert_connection(connection).await;
            known.insert(backend.id.clone(), backend.clone());
        }
        Ok(())
    }

    async fn prune_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let ids = self.aggregator.connection_ids().await;
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        cache.retain(&ids).await;
    }

    /// Connect every backend concurrently; failures are logged, not fatal.
    async fn connect_all(&self) {
        let connections = self.aggregator.connections().await;
        let mut handles = Vec::with_capacity(connections.len());
        for connection in connections {
            handles.push(tokio::spawn(async move {
                if let Err(e) = connection.connect().await {
                    error!(backend = %connection.id(), error = %e, "backend unavailable");
                }
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "connect task panicked");
            }
        }
    }

    async fn announce(&self) {
        if let Some(server) = self.server.read().await.clone() {
            server.refresh_capabilities().await;
        }
    }
}
