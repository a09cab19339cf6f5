//! Bridges a plugin's discovered MCP tools into its `manifest.json`: turns
//! the tool set reported by `tools/list` into `FunctionDecl`s, merges them
//! into the on-disk manifest with discovered functions winning on name
//! collision, and rewrites the file atomically. This is the "default
//! callback" a plugin's `on_input`/startup code wires up as the
//! `on_change` argument to [`crate::spawn_tool_poller`] so that adding or
//! removing an MCP tool shows up in the plugin's own manifest without the
//! plugin author writing any of this by hand.

use std::path::{Path, PathBuf};

use rise_protocol::manifest::{FunctionDecl, Manifest, ManifestError};
use serde_json::{Map, Value};

use crate::tool::McpTool;

#[derive(Debug, thiserror::Error)]
pub enum ManifestSyncError {
    #[error("failed to load manifest at {0}: {1}")]
    Load(PathBuf, #[source] ManifestError),

    #[error("failed to write manifest at {0}: {1}")]
    Write(PathBuf, #[source] ManifestError),
}

/// Turn one discovered MCP tool into a manifest function declaration.
/// `properties`/`required` are read out of the tool's JSON Schema
/// `input_schema` when it has the expected `object` shape; a schema that
/// doesn't declare either is treated as a no-argument function.
pub fn tool_to_function_decl(tool: &McpTool) -> FunctionDecl {
    let properties = tool
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);

    let required = tool
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    FunctionDecl {
        name: tool.full_name.clone(),
        description: tool.description.clone().unwrap_or_default(),
        tags: vec![format!("mcp:{}", tool.server_name)],
        properties,
        required,
    }
}

/// Load the manifest at `manifest_path`, merge in `discovered` (replacing
/// any previously-written functions with the same names), and rewrite it
/// atomically. A caller running this from a tool-poll callback should treat
/// a failure as worth logging but not fatal — the previous on-disk manifest
/// is left untouched if either the load or the write fails.
pub fn sync_manifest(manifest_path: &Path, discovered: &[McpTool]) -> Result<(), ManifestSyncError> {
    let mut manifest = Manifest::load_file(manifest_path).map_err(|e| ManifestSyncError::Load(manifest_path.to_path_buf(), e))?;
    let decls: Vec<FunctionDecl> = discovered.iter().map(tool_to_function_decl).collect();
    manifest.merge_discovered(decls);
    manifest
        .write_atomic(manifest_path)
        .map_err(|e| ManifestSyncError::Write(manifest_path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, schema: Value) -> McpTool {
        McpTool::new("weather", name, Some(format!("{name} desc")), schema)
    }

    #[test]
    fn converts_object_schema_properties_and_required() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"],
        });
        let decl = tool_to_function_decl(&tool("get_forecast", schema));
        assert_eq!(decl.name, "weather_get_forecast");
        assert_eq!(decl.required, vec!["city".to_string()]);
        assert!(decl.properties.contains_key("city"));
        assert_eq!(decl.tags, vec!["mcp:weather".to_string()]);
    }

    #[test]
    fn schema_without_properties_yields_a_no_argument_function() {
        let decl = tool_to_function_decl(&tool("ping", serde_json::json!({})));
        assert!(decl.properties.is_empty());
        assert!(decl.required.is_empty());
    }

    #[test]
    fn sync_manifest_merges_and_writes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.json");
        std::fs::write(
            &manifest_path,
            serde_json::to_string(&serde_json::json!({
                "manifestVersion": 1,
                "name": "weather",
                "version": "1.0.0",
                "description": "",
                "executable": "weather.exe",
                "persistent": true,
                "protocol_version": "2.0",
                "functions": [{"name": "static_fn", "description": "", "tags": [], "properties": {}, "required": []}]
            }))
            .unwrap(),
        )
        .unwrap();

        let discovered = vec![tool(
            "get_forecast",
            serde_json::json!({"properties": {"city": {"type": "string"}}, "required": ["city"]}),
        )];
        sync_manifest(&manifest_path, &discovered).unwrap();

        let reloaded = Manifest::load_file(&manifest_path).unwrap();
        let names: Vec<&str> = reloaded.functions.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"static_fn"));
        assert!(names.contains(&"weather_get_forecast"));
    }

    #[test]
    fn sync_manifest_replaces_a_previously_discovered_function_with_the_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.json");
        std::fs::write(
            &manifest_path,
            serde_json::to_string(&serde_json::json!({
                "manifestVersion": 1,
                "name": "weather",
                "version": "1.0.0",
                "description": "",
                "executable": "weather.exe",
                "persistent": true,
                "protocol_version": "2.0",
                "functions": [{"name": "weather_get_forecast", "description": "old", "tags": [], "properties": {}, "required": []}]
            }))
            .unwrap(),
        )
        .unwrap();

        let discovered = vec![tool("get_forecast", serde_json::json!({"properties": {"city": {}}, "required": ["city"]}))];
        sync_manifest(&manifest_path, &discovered).unwrap();

        let reloaded = Manifest::load_file(&manifest_path).unwrap();
        assert_eq!(reloaded.functions.len(), 1);
        assert_eq!(reloaded.functions[0].description, "get_forecast desc");
    }
}
