//! Capability aggregation and qualified-call routing.
//!
//! The aggregator merges per-backend capability sets into one namespace by
//! prefixing every name with its backend id, filters the merged set through
//! the active preset, and routes incoming qualified calls back to the
//! owning connection.

use crate::connection::{ConnectionStatus, DownstreamConnection};
use relay_core::{
    CapabilitySet, Preset, PromptDescriptor, RelayError, RelayResult, ResourceDescriptor,
    ToolDescriptor,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Prefix a capability name with its backend id.
pub fn qualify(server_id: &str, name: &str) -> String {
    format!("{server_id}:{name}")
}

/// Split a qualified name into backend id and local name.
///
/// Splits on the first colon only; backend ids cannot contain one, local
/// names (resource URIs in particular) may.
pub fn split_qualified(qualified: &str) -> RelayResult<(&str, &str)> {
    match qualified.split_once(':') {
        Some((server, name)) if !server.is_empty() && !name.is_empty() => Ok((server, name)),
        _ => Err(RelayError::Routing(format!(
            "'{qualified}' is not a qualified name (expected 'serverId:name')"
        ))),
    }
}

/// Immutable snapshot of the preset-filtered, qualified capability space.
///
/// Listings serve from this snapshot without touching any backend.
#[derive(Debug, Clone, Default)]
pub struct AggregateView {
    pub tools: Vec<ToolDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
}

/// Merges backend capabilities, applies the preset, routes calls.
pub struct Aggregator {
    connections: RwLock<HashMap<String, Arc<DownstreamConnection>>>,
    preset: RwLock<Arc<Preset>>,
    view: RwLock<Arc<AggregateView>>,
}

impl Aggregator {
    pub fn new(preset: Preset) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            preset: RwLock::new(Arc::new(preset)),
            view: RwLock::new(Arc::new(AggregateView::default())),
        }
    }

    pub async fn preset(&self) -> Arc<Preset> {
        self.preset.read().await.clone()
    }

    /// Swap in a new preset. The capability view is stale until the next
    /// [`refresh_view`](Self::refresh_view).
    pub async fn apply_preset(&self, preset: Preset) {
        info!(preset = %preset.id, "applying preset");
        *self.preset.write().await = Arc::new(preset);
    }

    pub async fn insert_connection(&self, connection: Arc<DownstreamConnection>) {
        self.connections
            .write()
            .await
            .insert(connection.id().to_string(), connection);
    }

    /// Remove a connection from routing. The caller owns teardown.
    pub async fn remove_connection(&self, server_id: &str) -> Option<Arc<DownstreamConnection>> {
        self.connections.write().await.remove(server_id)
    }

    pub async fn connection(&self, server_id: &str) -> Option<Arc<DownstreamConnection>> {
        self.connections.read().await.get(server_id).cloned()
    }

    pub async fn connections(&self) -> Vec<Arc<DownstreamConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn statuses(&self) -> Vec<ConnectionStatus> {
        let connections = self.connections().await;
        let mut statuses = Vec::with_capacity(connections.len());
        for connection in connections {
            statuses.push(connection.status().await);
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Rebuild the filtered view from backend capabilities.
    ///
    /// Queries only backends the preset references. A backend whose fetch
    /// fails (and has nothing cached) contributes nothing; the view is
    /// still rebuilt from the rest.
    pub async fn refresh_view(&self, force_refresh: bool) -> Arc<AggregateView> {
        let preset = self.preset().await;
        let wanted = preset.referenced_server_ids();

        let mut sets: HashMap<String, CapabilitySet> = HashMap::new();
        for server_id in &wanted {
            let Some(connection) = self.connection(server_id).await else {
                warn!(backend = %server_id, "preset references unknown backend");
                continue;
            };
            match connection.get_capabilities(force_refresh).await {
                Ok(set) => {
                    sets.insert((*server_id).to_string(), set);
                }
                Err(e) => {
                    warn!(backend = %server_id, error = %e, "backend excluded from view");
                }
            }
        }

        let view = Arc::new(build_view(&preset, &sets));
        *self.view.write().await = view.clone();
        info!(
            preset = %preset.id,
            tools = view.tools.len(),
            prompts = view.prompts.len(),
            resources = view.resources.len(),
            "capability view rebuilt"
        );
        view
    }

    /// Current filtered view. Never queries a backend.
    pub async fn view(&self) -> Arc<AggregateView> {
        self.view.read().await.clone()
    }

    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.view().await.tools.clone()
    }

    pub async fn list_prompts(&self) -> Vec<PromptDescriptor> {
        self.view().await.prompts.clone()
    }

    pub async fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.view().await.resources.clone()
    }

    /// Route a qualified tool call to its backend.
    ///
    /// Only tools present in the current view are callable: the preset is
    /// an allow-list, not advisory.
    pub async fn call_tool(
        &self,
        qualified: &str,
        arguments: serde_json::Value,
    ) -> RelayResult<serde_json::Value> {
        let (server_id, name) = split_qualified(qualified)?;
        if !self.view().await.tools.iter().any(|t| t.name == qualified) {
            return Err(RelayError::Routing(format!(
                "tool '{qualified}' is not exposed"
            )));
        }
        let connection = self.routable(server_id).await?;
        connection.call_tool(name, arguments).await
    }

    /// Route a qualified prompt fetch to its backend.
    pub async fn get_prompt(
        &self,
        qualified: &str,
        arguments: Option<serde_json::Value>,
    ) -> RelayResult<serde_json::Value> {
        let (server_id, name) = split_qualified(qualified)?;
        if !self.view().await.prompts.iter().any(|p| p.name == qualified) {
            return Err(RelayError::Routing(format!(
                "prompt '{qualified}' is not exposed"
            )));
        }
        let connection = self.routable(server_id).await?;
        connection.get_prompt(name, arguments).await
    }

    /// Route a qualified resource read to its backend.
    pub async fn read_resource(&self, qualified: &str) -> RelayResult<serde_json::Value> {
        let (server_id, uri) = split_qualified(qualified)?;
        if !self.view().await.resources.iter().any(|r| r.uri == qualified) {
            return Err(RelayError::Routing(format!(
                "resource '{qualified}' is not exposed"
            )));
        }
        let connection = self.routable(server_id).await?;
        connection.read_resource(uri).await
    }

    async fn routable(&self, server_id: &str) -> RelayResult<Arc<DownstreamConnection>> {
        self.connection(server_id)
            .await
            .ok_or_else(|| RelayError::Routing(format!("unknown backend '{server_id}'")))
    }
}

/// Apply the preset to the fetched sets and qualify every surviving name.
///
/// The exposed lists keep the preset's ordering; presets are curated and
/// their order is meaningful to the user.
fn build_view(preset: &Preset, sets: &HashMap<String, CapabilitySet>) -> AggregateView {
    let mut view = AggregateView::default();

    for reference in &preset.tools {
        if !reference.enabled {
            continue;
        }
        let Some(set) = sets.get(&reference.server_id) else {
            continue;
        };
        if let Some(tool) = set.tool(&reference.tool_name) {
            let mut tool = tool.clone();
            tool.name = qualify(&reference.server_id, &tool.name);
            view.tools.push(tool);
        }
    }

    // Prompt and resource lists absent from the preset expose nothing.
    for reference in preset.prompts.iter().flatten() {
        if !reference.enabled {
            continue;
        }
        let Some(set) = sets.get(&reference.server_id) else {
            continue;
        };
        if let Some(prompt) = set.prompt(&reference.prompt_name) {
            let mut prompt = prompt.clone();
            prompt.name = qualify(&reference.server_id, &prompt.name);
            view.prompts.push(prompt);
        }
    }

    for reference in preset.resources.iter().flatten() {
        if !reference.enabled {
            continue;
        }
        let Some(set) = sets.get(&reference.server_id) else {
            continue;
        };
        if let Some(resource) = set.resource(&reference.resource_key) {
            let mut resource = resource.clone();
            resource.uri = qualify(&reference.server_id, &resource.uri);
            resource.name = qualify(&reference.server_id, &resource.name);
            view.resources.push(resource);
        }
    }

    view
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relay_core::{PromptReference, ResourceReference, ToolReference};

    #[test]
    fn test_qualify_and_split_round_trip() {
        let qualified = qualify("github", "create_issue");
        assert_eq!(qualified, "github:create_issue");
        assert_eq!(split_qualified(&qualified).unwrap(), ("github", "create_issue"));
    }

    #[test]
    fn test_split_takes_first_colon_only() {
        let (server, uri) = split_qualified("files:file:///tmp/x").unwrap();
        assert_eq!(server, "files");
        assert_eq!(uri, "file:///tmp/x");
    }

    #[test]
    fn test_split_rejects_unqualified_names() {
        assert!(split_qualified("bare").is_err());
        assert!(split_qualified(":name").is_err());
        assert!(split_qualified("server:").is_err());
        assert!(split_qualified("").is_err());
    }

    fn set_with(tools: &[&str], prompts: &[&str], resources: &[(&str, &str)]) -> CapabilitySet {
        CapabilitySet {
            tools: tools
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.to_string(),
                    description: None,
                    input_schema: None,
                    output_schema: None,
                })
                .collect(),
            prompts: prompts
                .iter()
                .map(|name| PromptDescriptor {
                    name: name.to_string(),
                    description: None,
                })
                .collect(),
            resources: resources
                .iter()
                .map(|(name, uri)| ResourceDescriptor {
                    name: name.to_string(),
                    uri: uri.to_string(),
                    description: None,
                })
                .collect(),
        }
    }

    fn preset_with(tools: &[(&str, &str, bool)]) -> Preset {
        Preset {
            id: "p1".to_string(),
            name: "test".to_string(),
            tools: tools
                .iter()
                .map(|(server, tool, enabled)| ToolReference {
                    server_id: server.to_string(),
                    tool_name: tool.to_string(),
                    enabled: *enabled,
                })
                .collect(),
            prompts: None,
            resources: None,
        }
    }

    #[test]
    fn test_build_view_filters_and_qualifies_tools() {
        let mut sets = HashMap::new();
        sets.insert("s1".to_string(), set_with(&["a", "b"], &[], &[]));
        sets.insert("s2".to_string(), set_with(&["c"], &[], &[]));

        let preset = preset_with(&[("s1", "a", true), ("s1", "b", false), ("s2", "c", true)]);
        let view = build_view(&preset, &sets);

        let names: Vec<&str> = view.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["s1:a", "s2:c"]);
    }

    #[test]
    fn test_build_view_keeps_preset_order() {
        let mut sets = HashMap::new();
        sets.insert("s1".to_string(), set_with(&["a", "b"], &[], &[]));
        sets.insert("s2".to_string(), set_with(&["c"], &[], &[]));

        // Deliberately not alphabetical, and interleaved across backends.
        let preset = preset_with(&[("s1", "b", true), ("s2", "c", true), ("s1", "a", true)]);
        let view = build_view(&preset, &sets);

        let names: Vec<&str> = view.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["s1:b", "s2:c", "s1:a"]);
    }

    #[test]
    fn test_build_view_skips_references_backend_lacks() {
        let mut sets = HashMap::new();
        sets.insert("s1".to_string(), set_with(&["a"], &[], &[]));

        let preset = preset_with(&[("s1", "a", true), ("s1", "gone", true), ("s9", "x", true)]);
        let view = build_view(&preset, &sets);
        assert_eq!(view.tools.len(), 1);
        assert_eq!(view.tools[0].name, "s1:a");
    }

    #[test]
    fn test_absent_prompt_and_resource_lists_expose_nothing() {
        let mut sets = HashMap::new();
        sets.insert(
            "s1".to_string(),
            set_with(&[], &["greet"], &[("readme", "file:///r")]),
        );

        let preset = preset_with(&[]);
        let view = build_view(&preset, &sets);
        assert!(view.prompts.is_empty());
        assert!(view.resources.is_empty());
    }

    #[test]
    fn test_build_view_qualifies_prompts_and_resources() {
        let mut sets = HashMap::new();
        sets.insert(
            "s1".to_string(),
            set_with(&[], &["greet"], &[("readme", "file:///r")]),
        );

        let mut preset = preset_with(&[]);
        preset.prompts = Some(vec![PromptReference {
            server_id: "s1".to_string(),
            prompt_name: "greet".to_string(),
            enabled: true,
        }]);
        preset.resources = Some(vec![ResourceReference {
            server_id: "s1".to_string(),
            resource_key: "readme".to_string(),
            enabled: true,
        }]);

        let view = build_view(&preset, &sets);
        assert_eq!(view.prompts[0].name, "s1:greet");
        assert_eq!(view.resources[0].uri, "s1:file:///r");
        assert_eq!(view.resources[0].name, "s1:readme");
    }

    #[test]
    fn test_empty_preset_exposes_nothing() {
        let mut sets = HashMap::new();
        sets.insert("s1".to_string(), set_with(&["a"], &["p"], &[("r", "u://r")]));

        let view = build_view(&Preset::empty(), &sets);
        assert!(view.tools.is_empty());
        assert!(view.prompts.is_empty());
        assert!(view.resources.is_empty());
    }
}
