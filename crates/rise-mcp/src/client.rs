//! `McpClient` — session lifecycle, auto-refresh, and request/response
//! correlation for a plugin's MCP sub-client (spec §4.E).
//!
//! Grounded on `rocode-mcp`'s `McpClient`/transport split: a single
//! long-lived client owns one [`McpTransport`] and serializes every call
//! through it, the same "one transport, one mutex" shape the teacher uses
//! for its `HttpTransport`/`SseTransport` response channels.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use crate::protocol::{
    CallToolParams, CallToolResult, ClientInfo, InitializeParams, InitializeResult,
    JsonRpcMessage, JsonRpcRequest, ListToolsResult, RequestIdGen, ToolDefinition,
};
use crate::tool::{McpToolRegistry, ToolDiff};
use crate::transport::McpTransport;

#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server returned an error ({code}): {message}")]
    Server { code: i64, message: String },

    #[error("MCP session unauthorized")]
    Unauthorized,

    #[error("MCP request timed out")]
    Timeout,

    #[error("MCP client has no cached session and the server is unreachable")]
    Offline,
}

/// Policy knobs for session refresh and offline behaviour (spec §4.E).
#[derive(Debug, Clone)]
pub struct McpClientConfig {
    pub session_timeout: Duration,
    pub session_refresh_margin: Duration,
    pub discovery_timeout: Duration,
    pub request_timeout: Duration,
    pub client_name: String,
    pub client_version: String,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            session_refresh_margin: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: "rise-plugin-host".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    session_id: Option<String>,
    initialised_at: Option<Instant>,
    last_used_at: Option<Instant>,
    server_info: Option<serde_json::Value>,
}

/// A plugin's embedded MCP client. One instance per configured MCP server;
/// `server_name` namespaces discovered tools in the shared [`McpToolRegistry`].
pub struct McpClient {
    server_name: String,
    transport: Arc<dyn McpTransport>,
    ids: RequestIdGen,
    config: McpClientConfig,
    session: RwLock<SessionState>,
    call_lock: Mutex<()>,
}

impl McpClient {
    pub fn new(server_name: impl Into<String>, transport: Arc<dyn McpTransport>, config: McpClientConfig) -> Self {
        Self {
            server_name: server_name.into(),
            transport,
            ids: RequestIdGen::new(),
            config,
            session: RwLock::new(SessionState::default()),
            call_lock: Mutex::new(()),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub async fn is_initialised(&self) -> bool {
        self.session.read().await.initialised_at.is_some()
    }

    /// Perform the `initialize` handshake within `discovery_timeout`. On
    /// timeout, returns [`McpClientError::Offline`] without touching any
    /// previously cached session — the caller (the plugin's discovered
    /// function set) keeps serving from the manifest it already has
    /// (spec §4.E "Offline behaviour").
    pub async fn connect(&self) -> Result<InitializeResult, McpClientError> {
        match timeout(self.config.discovery_timeout, self.initialize()).await {
            Ok(result) => result,
            Err(_) => Err(McpClientError::Offline),
        }
    }

    async fn initialize(&self) -> Result<InitializeResult, McpClientError> {
        let params = InitializeParams {
            protocol_version: crate::protocol::MCP_JSONRPC_VERSION.to_string(),
            client_info: ClientInfo {
                name: self.config.client_name.clone(),
                version: self.config.client_version.clone(),
            },
            capabilities: serde_json::json!({}),
        };
        let value = self
            .request_raw("initialize", Some(serde_json::to_value(&params).map_err(|e| {
                McpClientError::Protocol(format!("failed to serialize initialize params: {e}"))
            })?))
            .await?;

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpClientError::Protocol(format!("bad initialize result: {e}")))?;

        let now = Instant::now();
        let mut session = self.session.write().await;
        session.session_id = result.session_id.clone();
        session.initialised_at = Some(now);
        session.last_used_at = Some(now);
        session.server_info = Some(serde_json::json!({
            "capabilities": result.capabilities,
            "expires_in_seconds": result.expires_in_seconds,
        }));
        Ok(result)
    }

    /// Refresh the session if it's within `session_refresh_margin` of
    /// `session_timeout` since last use, or if it was never initialised.
    async fn ensure_fresh(&self) -> Result<(), McpClientError> {
        let needs_refresh = {
            let session = self.session.read().await;
            match session.last_used_at {
                None => true,
                Some(last_used) => {
                    let elapsed = last_used.elapsed();
                    let threshold = self
                        .config
                        .session_timeout
                        .saturating_sub(self.config.session_refresh_margin);
                    elapsed >= threshold
                }
            }
        };
        if needs_refresh {
            self.initialize().await?;
        }
        Ok(())
    }

    async fn touch(&self) {
        self.session.write().await.last_used_at = Some(Instant::now());
    }

    /// Send one request and wait for its matching response, serialized
    /// behind `call_lock` so the poller and foreground calls never
    /// interleave writes on the same transport (spec §5).
    async fn request_raw(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value, McpClientError> {
        let _guard = self.call_lock.lock().await;
        let id = self.ids.next();
        let request = JsonRpcRequest::new(id, method, params);

        timeout(self.config.request_timeout, self.transport.send(&request))
            .await
            .map_err(|_| McpClientError::Timeout)??;

        loop {
            let message = timeout(self.config.request_timeout, self.transport.receive())
                .await
                .map_err(|_| McpClientError::Timeout)??;

            match message {
                None => return Err(McpClientError::Transport("connection closed".into())),
                Some(JsonRpcMessage::Notification(_)) => continue,
                Some(JsonRpcMessage::Response(response)) => {
                    if response.id != id {
                        tracing::debug!(expected = id, got = response.id, "dropping mismatched MCP response");
                        continue;
                    }
                    if let Some(error) = response.error {
                        return Err(McpClientError::Server {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return Ok(response.result.unwrap_or(serde_json::Value::Null));
                }
            }
        }
    }

    /// Issue a request that needs a fresh session, retrying exactly once
    /// after a forced re-`initialize` if the server reports the session is
    /// gone (spec §4.E: "On HTTP error in {400, 401, 403}, ... retry the
    /// request exactly once; a second failure is surfaced").
    async fn call_with_session(&self, method: &str, params: Option<serde_json::Value>) -> Result<serde_json::Value, McpClientError> {
        self.ensure_fresh().await?;
        match self.request_raw(method, params.clone()).await {
            Ok(value) => {
                self.touch().await;
                Ok(value)
            }
            Err(McpClientError::Unauthorized) => {
                self.initialize().await?;
                let value = self.request_raw(method, params).await?;
                self.touch().await;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpClientError> {
        let value = self.call_with_session("tools/list", None).await?;
        let result: ListToolsResult =
            serde_json::from_value(value).map_err(|e| McpClientError::Protocol(format!("bad tools/list result: {e}")))?;
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<serde_json::Value>) -> Result<CallToolResult, McpClientError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let value = self
            .call_with_session(
                "tools/call",
                Some(serde_json::to_value(&params).map_err(|e| McpClientError::Protocol(e.to_string()))?),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| McpClientError::Protocol(format!("bad tools/call result: {e}")))
    }

    pub async fn list_resources(&self) -> Result<serde_json::Value, McpClientError> {
        self.call_with_session("resources/list", None).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, McpClientError> {
        self.call_with_session("resources/read", Some(serde_json::json!({"uri": uri}))).await
    }

    pub async fn list_prompts(&self) -> Result<serde_json::Value, McpClientError> {
        self.call_with_session("prompts/list", None).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<serde_json::Value>) -> Result<serde_json::Value, McpClientError> {
        self.call_with_session("prompts/get", Some(serde_json::json!({"name": name, "arguments": arguments})))
            .await
    }

    pub async fn close(&self) -> Result<(), McpClientError> {
        self.transport.close().await.map_err(|e| McpClientError::Transport(e.to_string()))
    }
}

/// Background tool-change poller (spec §4.E): every `poll_interval`, calls
/// `tools/list`, diffs against the shared registry, and invokes
/// `on_change(diff, all_tools)` when anything changed. Returns a handle the
/// caller can abort on shutdown.
pub fn spawn_tool_poller(
    client: Arc<McpClient>,
    registry: Arc<McpToolRegistry>,
    poll_interval: Duration,
    on_change: impl Fn(ToolDiff, Vec<crate::tool::McpTool>) + Send + Sync + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if poll_interval.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            let tools = match client.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server = client.server_name(), error = %e, "MCP tool poll failed");
                    continue;
                }
            };
            let diff = registry.reconcile(client.server_name(), tools).await;
            if !diff.is_empty() {
                let all = registry.list_for_server(client.server_name()).await;
                on_change(diff, all);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcResponse;
    use crate::transport::McpTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    /// An in-memory transport that echoes back whatever id it was last sent
    /// and answers `initialize` with a session id, `tools/list` with the
    /// next canned tool set. Lets the client's real id allocation and
    /// session/refresh logic run unmodified.
    struct FakeTransport {
        last_id: AtomicU64,
        last_method: TokioMutex<String>,
        tool_sets: TokioMutex<Vec<Vec<ToolDefinition>>>,
    }

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({}),
        }
    }

    #[async_trait]
    impl McpTransport for FakeTransport {
        async fn send(&self, request: &JsonRpcRequest) -> Result<(), McpClientError> {
            self.last_id.store(request.id, Ordering::SeqCst);
            *self.last_method.lock().await = request.method.clone();
            Ok(())
        }

        async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpClientError> {
            let id = self.last_id.load(Ordering::SeqCst);
            let method = self.last_method.lock().await.clone();
            let result = if method == "initialize" {
                serde_json::json!({"sessionId": "s1", "capabilities": {}})
            } else {
                let mut sets = self.tool_sets.lock().await;
                let tools = if sets.is_empty() { vec![] } else { sets.remove(0) };
                serde_json::json!({"tools": tools})
            };
            Ok(Some(JsonRpcMessage::Response(JsonRpcResponse {
                id,
                result: Some(result),
                error: None,
            })))
        }

        async fn close(&self) -> Result<(), McpClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn list_tools_initialises_the_session_first() {
        let transport = Arc::new(FakeTransport {
            last_id: AtomicU64::new(0),
            last_method: TokioMutex::new(String::new()),
            tool_sets: TokioMutex::new(vec![vec![tool("a"), tool("b")]]),
        });
        let client = McpClient::new("weather", transport, McpClientConfig::default());
        assert!(!client.is_initialised().await);

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert!(client.is_initialised().await);
    }

    #[tokio::test]
    async fn poller_reports_only_actual_diffs() {
        let transport = Arc::new(FakeTransport {
            last_id: AtomicU64::new(0),
            last_method: TokioMutex::new(String::new()),
            tool_sets: TokioMutex::new(vec![vec![tool("a"), tool("b")], vec![tool("a"), tool("c")]]),
        });
        let client = Arc::new(McpClient::new("weather", transport, McpClientConfig::default()));
        let registry = Arc::new(McpToolRegistry::new());

        let first = client.list_tools().await.unwrap();
        registry.reconcile("weather", first).await;

        let second = client.list_tools().await.unwrap();
        let diff = registry.reconcile("weather", second).await;
        assert_eq!(diff.added, vec!["weather_c".to_string()]);
        assert_eq!(diff.removed, vec!["weather_b".to_string()]);
    }

    #[test]
    fn error_display_is_human_readable() {
        let err = McpClientError::Server {
            code: -32601,
            message: "no such tool".into(),
        };
        assert!(err.to_string().contains("no such tool"));
    }
}
