//! Tool catalogue discovered from an MCP server's `tools/list`, keyed by
//! `<server>_<tool>` so tools from different servers never collide.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::protocol::ToolDefinition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub server_name: String,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

impl McpTool {
    pub fn new(
        server_name: &str,
        name: &str,
        description: Option<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            name: name.to_string(),
            full_name: format!("{server_name}_{name}"),
            description,
            input_schema,
        }
    }
}

#[derive(Default)]
pub struct McpToolRegistry {
    tools: RwLock<HashMap<String, McpTool>>,
}

impl McpToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_batch(&self, server_name: &str, defs: Vec<ToolDefinition>) {
        let mut tools = self.tools.write().await;
        for def in defs {
            let tool = McpTool::new(server_name, &def.name, def.description, def.input_schema);
            tools.insert(tool.full_name.clone(), tool);
        }
    }

    /// Replace this server's tools with `defs`, returning the names added
    /// and removed relative to the previous snapshot (spec §4.F polling).
    pub async fn reconcile(&self, server_name: &str, defs: Vec<ToolDefinition>) -> ToolDiff {
        let mut tools = self.tools.write().await;
        let previous: Vec<String> = tools
            .values()
            .filter(|t| t.server_name == server_name)
            .map(|t| t.full_name.clone())
            .collect();

        tools.retain(|_, t| t.server_name != server_name);
        let mut added = Vec::new();
        for def in defs {
            let tool = McpTool::new(server_name, &def.name, def.description, def.input_schema);
            added.push(tool.full_name.clone());
            tools.insert(tool.full_name.clone(), tool);
        }

        let removed: Vec<String> = previous.iter().filter(|n| !added.contains(n)).cloned().collect();
        let added: Vec<String> = added.iter().filter(|n| !previous.contains(n)).cloned().collect();

        ToolDiff { added, removed }
    }

    pub async fn get(&self, full_name: &str) -> Option<McpTool> {
        self.tools.read().await.get(full_name).cloned()
    }

    pub async fn list(&self) -> Vec<McpTool> {
        self.tools.read().await.values().cloned().collect()
    }

    pub async fn list_for_server(&self, server_name: &str) -> Vec<McpTool> {
        self.tools
            .read()
            .await
            .values()
            .filter(|t| t.server_name == server_name)
            .cloned()
            .collect()
    }

    pub async fn clear_server(&self, server_name: &str) {
        self.tools.write().await.retain(|_, t| t.server_name != server_name);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ToolDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn reconcile_reports_added_and_removed() {
        let registry = McpToolRegistry::new();
        registry.register_batch("weather", vec![def("forecast"), def("alerts")]).await;

        let diff = registry.reconcile("weather", vec![def("forecast"), def("radar")]).await;
        assert_eq!(diff.added, vec!["weather_radar".to_string()]);
        assert_eq!(diff.removed, vec!["weather_alerts".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_with_same_set_is_a_no_op_diff() {
        let registry = McpToolRegistry::new();
        registry.register_batch("weather", vec![def("forecast")]).await;
        let diff = registry.reconcile("weather", vec![def("forecast")]).await;
        assert!(diff.is_empty());
    }
}
