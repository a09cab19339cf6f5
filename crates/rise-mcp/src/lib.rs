//! MCP sub-client (spec §4.E): lets a plugin declare `mcp.enabled = true` in
//! its manifest and have the host maintain a session with an external Model
//! Context Protocol server on the plugin's behalf — transport plumbing,
//! session lifecycle (initialize, auto-refresh, retry-once-on-auth-loss),
//! tool discovery/polling, and optional OAuth for servers that require it.

pub mod auth;
pub mod client;
pub mod manifest_sync;
pub mod oauth;
pub mod protocol;
pub mod tool;
pub mod transport;

pub use client::{spawn_tool_poller, McpClient, McpClientConfig, McpClientError};
pub use manifest_sync::{sync_manifest, tool_to_function_decl, ManifestSyncError};
pub use oauth::{AuthStatus, McpOAuthConfig, McpOAuthManager, OAuthError, OAuthRegistry};
pub use protocol::{
    CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcResponseError,
    ListToolsResult, ToolDefinition,
};
pub use tool::{McpTool, McpToolRegistry, ToolDiff};
pub use transport::{HttpTransport, McpTransport, SseTransport, StdioTransport};
