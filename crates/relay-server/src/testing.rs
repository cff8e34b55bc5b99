//! Shared fixtures for transport tests: stub backends and a pre-wired
//! aggregator.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use relay_client::BackendClient;
use relay_core::{
    BackendConfig, CapabilitySet, Preset, RelayResult, ToolDescriptor, ToolReference,
    TransportDescriptor,
};
use relay_proxy::{Aggregator, ConnectionSettings, DownstreamConnection};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct FakeBackend {
    tools: Vec<&'static str>,
}

impl FakeBackend {
    pub fn new(tools: &[&'static str]) -> Self {
        Self {
            tools: tools.to_vec(),
        }
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn connect(&mut self) -> RelayResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) {}

    async fn list_capabilities(&mut self) -> RelayResult<CapabilitySet> {
        Ok(CapabilitySet {
            tools: self
                .tools
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.to_string(),
                    description: None,
                    input_schema: None,
                    output_schema: None,
                })
                .collect(),
            prompts: vec![],
            resources: vec![],
        })
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> RelayResult<serde_json::Value> {
        Ok(serde_json::json!({"tool": name, "args": arguments}))
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

/// Build an aggregator over the given stub backends with a preset
/// selecting the given tool references, connected and with a computed view.
pub async fn scenario_aggregator(
    backends: &[(&str, FakeBackend)],
    selected: &[(&str, &str)],
) -> Arc<Aggregator> {
    let preset = Preset {
        id: "test".to_string(),
        name: "Test".to_string(),
        tools: selected
            .iter()
            .map(|(server, tool)| ToolReference {
                server_id: server.to_string(),
                tool_name: tool.to_string(),
                enabled: true,
            })
            .collect(),
        prompts: None,
        resources: None,
    };

    let aggregator = Arc::new(Aggregator::new(preset));
    let settings = Arc::new(RwLock::new(ConnectionSettings::default()));
    for (id, backend) in backends {
        let config = BackendConfig {
            id: id.to_string(),
            name: id.to_string(),
            transport: TransportDescriptor::Websocket {
                url: "ws://unused".to_string(),
            },
            env: Default::default(),
            enabled: true,
            auth: None,
        };
        let connection = Arc::new(DownstreamConnection::new(
            config,
            Box::new(FakeBackend {
                tools: backend.tools.clone(),
            }),
            settings.clone(),
            None,
        ));
        connection.connect().await.unwrap();
        aggregator.insert_connection(connection).await;
    }
    aggregator.refresh_view(false).await;
    aggregator
}
