//! Streaming output, logging, and the terminal `complete`/`error`
//! notifications, all emitted as JSON-RPC notifications on the plugin's
//! stdout (spec §4.D, §6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rise_protocol::frame::{FrameError, FrameWriter};
use rise_protocol::rpc::RpcMessage;
use serde_json::Value;
use tokio::io::Stdout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Handed to a command handler for the lifetime of one `execute`/`input`
/// call. Every notification sent through this emitter carries the call's
/// request id so the host's Engine Core can route it back to the right
/// in-flight caller (spec §4.G step 5).
#[derive(Clone)]
pub struct StreamEmitter {
    writer: Arc<FrameWriter<Stdout>>,
    request_id: u64,
    keep_session: Arc<AtomicBool>,
}

impl StreamEmitter {
    pub(crate) fn new(writer: Arc<FrameWriter<Stdout>>, request_id: u64) -> Self {
        Self {
            writer,
            request_id,
            keep_session: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Emit one chunk of streamed output. Chunks arrive at the caller in
    /// the order they're sent; no `stream` notification may legally follow
    /// this request's terminal `complete`/`error` (spec §8 invariant 3) —
    /// the run loop enforces that by sending the terminal notification
    /// only after the handler future has returned.
    pub async fn stream(&self, data: impl Into<Value>) -> Result<(), FrameError> {
        let notification = RpcMessage::notification(
            "stream",
            Some(serde_json::json!({
                "request_id": self.request_id,
                "data": data.into(),
            })),
        );
        self.writer.send(&notification.to_value()).await
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<(), FrameError> {
        let notification = RpcMessage::notification(
            "log",
            Some(serde_json::json!({
                "level": level.as_str(),
                "message": message.into(),
            })),
        );
        self.writer.send(&notification.to_value()).await
    }

    /// Ask the host to keep this plugin as the passthrough session owner
    /// after this call completes, instead of returning to Idle. The host
    /// enforces a single owner at a time (spec §4.H); a plugin that never
    /// calls this releases ownership as soon as its `complete` notification
    /// is sent.
    pub fn set_keep_session(&self, keep: bool) {
        self.keep_session.store(keep, Ordering::SeqCst);
    }

    pub(crate) fn wants_keep_session(&self) -> bool {
        self.keep_session.load(Ordering::SeqCst)
    }

    pub(crate) async fn send_complete(&self, success: bool, data: Value) -> Result<(), FrameError> {
        let notification = RpcMessage::notification(
            "complete",
            Some(serde_json::json!({
                "request_id": self.request_id,
                "success": success,
                "data": data,
                "keep_session": self.wants_keep_session(),
            })),
        );
        self.writer.send(&notification.to_value()).await
    }

    pub(crate) async fn send_error(&self, code: i64, message: impl Into<String>) -> Result<(), FrameError> {
        let notification = RpcMessage::notification(
            "error",
            Some(serde_json::json!({
                "request_id": self.request_id,
                "code": code,
                "message": message.into(),
            })),
        );
        self.writer.send(&notification.to_value()).await
    }
}
