//! Presets: curated, ordered selections of backend capabilities.
//!
//! The aggregator computes its exposed capability list from exactly one
//! preset instance at a time; presets are swapped atomically and never
//! edited in place.

use serde::{Deserialize, Serialize};

/// Reserved id of the built-in preset that selects nothing.
pub const EMPTY_PRESET_ID: &str = "__empty__";

/// Reference to one tool of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolReference {
    pub server_id: String,
    pub tool_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Reference to one prompt of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptReference {
    pub server_id: String,
    pub prompt_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Reference to one resource of one backend, keyed by resource name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    pub server_id: String,
    pub resource_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// A named, ordered selection of which backend capabilities are exposed.
///
/// The exposed list follows preset order, not backend-registration order.
/// `prompts`/`resources` being `None` and being an empty list mean the same
/// thing: nothing is exposed for that facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tools: Vec<ToolReference>,
    #[serde(default)]
    pub prompts: Option<Vec<PromptReference>>,
    #[serde(default)]
    pub resources: Option<Vec<ResourceReference>>,
}

impl Preset {
    /// The built-in preset that exposes nothing.
    pub fn empty() -> Self {
        Self {
            id: EMPTY_PRESET_ID.to_string(),
            name: "Empty".to_string(),
            tools: Vec::new(),
            prompts: None,
            resources: None,
        }
    }

    pub fn is_empty_preset(&self) -> bool {
        self.id == EMPTY_PRESET_ID
    }

    /// Distinct ids of every backend this preset references.
    pub fn referenced_server_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .tools
            .iter()
            .map(|t| t.server_id.as_str())
            .chain(
                self.prompts
                    .iter()
                    .flatten()
                    .map(|p| p.server_id.as_str()),
            )
            .chain(
                self.resources
                    .iter()
                    .flatten()
                    .map(|r| r.server_id.as_str()),
            )
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_parse_camel_case() {
        let json = r#"{
            "id": "dev",
            "name": "Development",
            "tools": [{"serverId": "fs", "toolName": "read_file"}],
            "prompts": [{"serverId": "fs", "promptName": "summarize", "enabled": false}]
        }"#;
        let preset: Preset = serde_json::from_str(json).unwrap();
        assert_eq!(preset.tools[0].server_id, "fs");
        assert!(preset.tools[0].enabled, "enabled defaults to true");
        assert!(!preset.prompts.as_ref().unwrap()[0].enabled);
        assert!(preset.resources.is_none());
    }

    #[test]
    fn test_empty_preset_sentinel() {
        let preset = Preset::empty();
        assert_eq!(preset.id, EMPTY_PRESET_ID);
        assert!(preset.is_empty_preset());
        assert!(preset.tools.is_empty());
    }

    #[test]
    fn test_referenced_server_ids_deduplicated() {
        let preset: Preset = serde_json::from_str(
            r#"{
                "id": "p",
                "tools": [
                    {"serverId": "s2", "toolName": "a"},
                    {"serverId": "s1", "toolName": "b"},
                    {"serverId": "s1", "toolName": "c"}
                ],
                "resources": [{"serverId": "s3", "resourceKey": "r"}]
            }"#,
        )
        .unwrap();
        assert_eq!(preset.referenced_server_ids(), vec!["s1", "s2", "s3"]);
    }
}
