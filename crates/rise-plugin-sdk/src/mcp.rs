//! Wires a plugin's embedded MCP sub-client to its own `manifest.json`: the
//! plugin calls [`watch_and_sync`] once per configured MCP server at
//! startup, and from then on any tool the server adds or removes is
//! reflected in the plugin's manifest automatically, without the plugin's
//! own command handlers touching the filesystem.

use std::sync::Arc;
use std::time::Duration;

use rise_mcp::{spawn_tool_poller, McpClient, McpToolRegistry};

use crate::ctx::PluginCtx;

/// Start the background tool-change poller for `client` and keep
/// `ctx.plugin_dir/manifest.json` in sync with whatever it reports.
/// `registry` is shared across every configured MCP server so a plugin with
/// more than one server still resolves tool names into one namespace.
pub fn watch_and_sync(
    ctx: &PluginCtx,
    client: Arc<McpClient>,
    registry: Arc<McpToolRegistry>,
    poll_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let manifest_path = ctx.plugin_dir.join("manifest.json");
    spawn_tool_poller(client, registry, poll_interval, move |diff, all_tools| {
        tracing::info!(added = diff.added.len(), removed = diff.removed.len(), "MCP tool set changed, rewriting manifest");
        if let Err(e) = rise_mcp::sync_manifest(&manifest_path, &all_tools) {
            tracing::warn!(error = %e, path = %manifest_path.display(), "failed to sync manifest after MCP tool change");
        }
    })
}
