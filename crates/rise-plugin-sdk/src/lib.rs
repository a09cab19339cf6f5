//! Plugin SDK (spec §4.D) — everything a third-party plugin binary links
//! against to speak the host's framed JSON-RPC protocol without hand-rolling
//! the codec or the `initialize`/`ping`/`execute`/`input`/`shutdown`
//! dispatch loop.
//!
//! The run loop is single-threaded cooperative on the read side (it reads
//! one frame, dispatches it, then reads the next) but spawns each
//! `execute`/`input` call onto its own task so a slow or streaming handler
//! never blocks `ping` handling for a different in-flight request — the
//! guarantee spec §4.D asks for ("the SDK guarantees that `ping` is
//! answered within the handling of the next read").

pub mod ctx;
pub mod mcp;
pub mod registry;
pub mod stream;

pub use ctx::PluginCtx;
pub use mcp::watch_and_sync;
pub use registry::{CommandHandler, CommandRegistry, FnCommand};
pub use stream::{LogLevel, StreamEmitter};

use std::sync::Arc;

use rise_protocol::frame::{self, FrameError, FrameWriter};
use rise_protocol::rpc::{parse_message, ErrorCode, ParseOutcome, RpcError, RpcMessage};
use serde_json::Value;
use tokio::io::{stdin, stdout, Stdout};

#[derive(Debug, thiserror::Error)]
pub enum PluginSdkError {
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("plugin error: {0}")]
    Plugin(String),
}

impl From<&PluginSdkError> for ErrorCode {
    fn from(e: &PluginSdkError) -> Self {
        match e {
            PluginSdkError::UnknownFunction(_) => ErrorCode::MethodNotFound,
            PluginSdkError::InvalidArguments(_) => ErrorCode::InvalidParams,
            PluginSdkError::Frame(_) => ErrorCode::InternalError,
            PluginSdkError::Plugin(_) => ErrorCode::PluginError,
        }
    }
}

impl From<PluginSdkError> for RpcError {
    fn from(e: PluginSdkError) -> Self {
        let code = ErrorCode::from(&e);
        RpcError::new(code, e.to_string())
    }
}

/// One plugin process: its declared name/version/description and the
/// functions it answers to. Build one of these in `main`, register
/// commands, then call [`PluginApp::run`] to hand control to the SDK's
/// stdin/stdout dispatch loop.
pub struct PluginApp {
    name: String,
    version: String,
    description: String,
    registry: CommandRegistry,
}

impl PluginApp {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            registry: CommandRegistry::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn command(mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) -> Self {
        self.registry.register(name, handler);
        self
    }

    pub fn command_described(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> Self {
        self.registry.register_described(name, description, handler);
        self
    }

    /// Register the handler invoked for every `input` method call while
    /// this plugin owns the passthrough session. Absent a registration the
    /// run loop echoes the turn's content back prefixed with "You said: ".
    pub fn on_input(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.registry.set_on_input(handler);
        self
    }

    /// Run the plugin's stdin/stdout dispatch loop until the host sends the
    /// `shutdown` notification or closes the pipe.
    pub async fn run(self) -> Result<(), PluginSdkError> {
        let writer = Arc::new(FrameWriter::new(stdout()));
        let registry = Arc::new(self.registry);
        let ctx = Arc::new(PluginCtx::new());

        let mut input = stdin();
        loop {
            let raw = match frame::decode(&mut input).await {
                Ok(v) => v,
                Err(FrameError::UnexpectedEof) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed frame from host, dropping connection");
                    return Err(PluginSdkError::Frame(e));
                }
            };

            let message = match parse_message(&raw) {
                Ok(m) => m,
                Err(ParseOutcome::InvalidRequest { id }) => {
                    if let Some(id) = id {
                        let err = RpcError::new(ErrorCode::InvalidRequest, "malformed envelope");
                        writer.send(&RpcMessage::response_err(id, err).to_value()).await?;
                    }
                    continue;
                }
            };

            match message {
                RpcMessage::Request { id, method, params } => match method.as_str() {
                    "initialize" => {
                        let result = serde_json::json!({
                            "name": self.name,
                            "version": self.version,
                            "description": self.description,
                            "protocol_version": rise_protocol::rpc::JSONRPC_VERSION,
                            "commands": registry.descriptors(),
                        });
                        writer.send(&RpcMessage::response_ok(id, result).to_value()).await?;
                    }
                    "ping" => {
                        let timestamp = params
                            .as_ref()
                            .and_then(|p| p.get("timestamp"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        writer
                            .send(&RpcMessage::response_ok(id, serde_json::json!({"timestamp": timestamp})).to_value())
                            .await?;
                    }
                    "execute" => {
                        spawn_execute(id, params.unwrap_or(Value::Null), Arc::clone(&registry), Arc::clone(&writer), Arc::clone(&ctx));
                    }
                    "input" => {
                        let content = params
                            .as_ref()
                            .and_then(|p| p.get("content"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        writer
                            .send(&RpcMessage::response_ok(id, serde_json::json!({"acknowledged": true})).to_value())
                            .await?;
                        spawn_input(id, content, Arc::clone(&registry), Arc::clone(&writer), Arc::clone(&ctx));
                    }
                    other => {
                        let err = RpcError::new(ErrorCode::MethodNotFound, format!("unknown method `{other}`"));
                        writer.send(&RpcMessage::response_err(id, err).to_value()).await?;
                    }
                },
                RpcMessage::Notification { method, .. } => {
                    if method == "shutdown" {
                        return Ok(());
                    }
                }
                RpcMessage::Response { .. } => {
                    // Plugins don't issue host-bound requests in this SDK; ignore.
                }
            }
        }
    }
}

/// Run a handler to completion and translate its outcome into the terminal
/// `complete`/`error` notification for `request_id` (spec §4.D, §7).
async fn finish_with_terminal(emitter: &StreamEmitter, outcome: Result<Value, PluginSdkError>) {
    let send_result = match outcome {
        Ok(data) => emitter.send_complete(true, data).await,
        Err(e) => {
            let code = ErrorCode::from(&e).code();
            emitter.send_error(code, e.to_string()).await
        }
    };
    if let Err(e) = send_result {
        tracing::warn!(error = %e, "failed to send terminal notification to host");
    }
}

fn spawn_execute(id: u64, params: Value, registry: Arc<CommandRegistry>, writer: Arc<FrameWriter<Stdout>>, ctx: Arc<PluginCtx>) {
    tokio::spawn(async move {
        let emitter = StreamEmitter::new(writer, id);
        let function_name = params.get("function").and_then(Value::as_str).map(str::to_string);
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let outcome = async {
            let name = function_name
                .ok_or_else(|| PluginSdkError::InvalidArguments("missing `function`".into()))?;
            let handler = registry
                .get(&name)
                .ok_or_else(|| PluginSdkError::UnknownFunction(name.clone()))?;
            handler.call(&ctx, arguments, emitter.clone()).await
        }
        .await;

        finish_with_terminal(&emitter, outcome).await;
    });
}

fn spawn_input(id: u64, content: String, registry: Arc<CommandRegistry>, writer: Arc<FrameWriter<Stdout>>, ctx: Arc<PluginCtx>) {
    tokio::spawn(async move {
        let emitter = StreamEmitter::new(writer, id);

        let outcome = match registry.on_input() {
            Some(handler) => handler.call(&ctx, serde_json::json!({"content": content}), emitter.clone()).await,
            None => Ok(Value::String(format!("You said: {content}"))),
        };

        finish_with_terminal(&emitter, outcome).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn call(&self, _ctx: &PluginCtx, params: Value, _stream: StreamEmitter) -> Result<Value, PluginSdkError> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn registry_resolves_registered_commands() {
        let mut registry = CommandRegistry::new();
        registry.register("echo", Echo);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn echo_handler_returns_its_input() {
        let handler = Echo;
        let writer = Arc::new(FrameWriter::new(tokio::io::stdout()));
        let emitter = StreamEmitter::new(writer, 1);
        let ctx = PluginCtx::new();
        let result = handler.call(&ctx, serde_json::json!({"x": 1}), emitter).await.unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[test]
    fn unknown_function_maps_to_method_not_found_code() {
        let err = PluginSdkError::UnknownFunction("nope".into());
        assert_eq!(ErrorCode::from(&err).code(), -32601);
    }

    #[test]
    fn plugin_error_maps_to_negative_one() {
        let err = PluginSdkError::Plugin("boom".into());
        assert_eq!(ErrorCode::from(&err).code(), -1);
    }
}
