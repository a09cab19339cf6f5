//! Transport variants for talking to an MCP server: stdio (child process),
//! streamable HTTP, and SSE (spec §4.E).

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;

use crate::client::McpClientError;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest};

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send(&self, request: &JsonRpcRequest) -> Result<(), McpClientError>;
    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpClientError>;
    async fn close(&self) -> Result<(), McpClientError>;
}

// ---------------------------------------------------------------------------
// StdioTransport
// ---------------------------------------------------------------------------

pub struct StdioTransport {
    process: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: Option<Vec<(String, String)>>,
    ) -> Result<Self, McpClientError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(env_vars) = env {
            for (key, value) in env_vars {
                cmd.env(key, value);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpClientError::Transport(format!("failed to spawn MCP server: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpClientError::Transport("failed to capture stdin".into()))?;

        Ok(Self {
            process: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<(), McpClientError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpClientError::Transport("server process not running".into()))?;

        let content = serde_json::to_string(request)
            .map_err(|e| McpClientError::Protocol(format!("failed to serialize request: {e}")))?;
        let framed = format!("Content-Length: {}\r\n\r\n{}", content.len(), content);

        stdin
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| McpClientError::Transport(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpClientError::Transport(format!("flush failed: {e}")))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpClientError> {
        let mut guard = self.process.lock().await;
        let child = guard
            .as_mut()
            .ok_or_else(|| McpClientError::Transport("server process not running".into()))?;
        let stdout = child
            .stdout
            .as_mut()
            .ok_or_else(|| McpClientError::Transport("no stdout pipe".into()))?;

        let mut reader = BufReader::new(stdout);
        let mut header_line = String::new();
        loop {
            header_line.clear();
            let bytes_read = reader
                .read_line(&mut header_line)
                .await
                .map_err(|e| McpClientError::Transport(format!("read failed: {e}")))?;
            if bytes_read == 0 {
                return Ok(None);
            }

            let trimmed = header_line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(len) = trimmed.strip_prefix("Content-Length:") {
                let content_length: usize = len
                    .trim()
                    .parse()
                    .map_err(|e| McpClientError::Protocol(format!("bad Content-Length: {e}")))?;

                // Consume the blank line separating headers from the body.
                let mut blank = String::new();
                reader
                    .read_line(&mut blank)
                    .await
                    .map_err(|e| McpClientError::Transport(format!("read failed: {e}")))?;

                let mut body = vec![0u8; content_length];
                reader
                    .read_exact(&mut body)
                    .await
                    .map_err(|e| McpClientError::Transport(format!("read failed: {e}")))?;

                let text = String::from_utf8_lossy(&body);
                let message = JsonRpcMessage::from_str(&text)
                    .map_err(|e| McpClientError::Protocol(format!("bad message: {e}")))?;
                return Ok(Some(message));
            }
        }
    }

    async fn close(&self) -> Result<(), McpClientError> {
        let mut guard = self.process.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.kill().await;
        }
        *self.stdin.lock().await = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HttpTransport (streamable HTTP)
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    response_rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>>,
    response_tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

impl HttpTransport {
    pub fn new(url: String, headers: Option<HashMap<String, String>>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            url,
            headers: headers.unwrap_or_default(),
            client: reqwest::Client::new(),
            response_rx: Mutex::new(rx),
            response_tx: tx,
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<(), McpClientError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream");
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let body = serde_json::to_string(request)
            .map_err(|e| McpClientError::Protocol(format!("failed to serialize request: {e}")))?;
        let resp = builder
            .body(body)
            .send()
            .await
            .map_err(|e| McpClientError::Transport(format!("HTTP request failed: {e}")))?;

        let status = resp.status();
        if matches!(
            status,
            reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
        ) {
            // Spec §4.E: 400/401/403 are all treated as "the session is
            // gone" so the client re-initialises and retries once.
            return Err(McpClientError::Unauthorized);
        }
        if !status.is_success() {
            return Err(McpClientError::Transport(format!("HTTP {status} from server")));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = resp
            .text()
            .await
            .map_err(|e| McpClientError::Transport(format!("failed to read body: {e}")))?;

        if content_type.contains("text/event-stream") {
            for line in text.lines() {
                if let Some(data) = line.trim().strip_prefix("data:") {
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    if let Ok(message) = JsonRpcMessage::from_str(data) {
                        let _ = self.response_tx.send(message);
                    }
                }
            }
        } else if !text.is_empty() {
            let message = JsonRpcMessage::from_str(&text)
                .map_err(|e| McpClientError::Protocol(format!("bad response: {e}")))?;
            let _ = self.response_tx.send(message);
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpClientError> {
        Ok(self.response_rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), McpClientError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SseTransport
// ---------------------------------------------------------------------------

pub struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    response_rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>>,
    response_tx: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    sse_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(url: String, headers: Option<HashMap<String, String>>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            url,
            headers: headers.unwrap_or_default(),
            client: reqwest::Client::new(),
            response_rx: Mutex::new(rx),
            response_tx: tx,
            sse_task: Mutex::new(None),
        }
    }

    pub async fn connect(&self) -> Result<(), McpClientError> {
        use futures::StreamExt;
        use reqwest_eventsource::{Event, EventSource};

        let mut builder = self.client.get(&self.url).header("Accept", "text/event-stream");
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let mut es = EventSource::new(builder)
            .map_err(|e| McpClientError::Transport(format!("failed to open SSE stream: {e}")))?;
        let tx = self.response_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Message(msg)) => {
                        let data = msg.data.trim();
                        if data.is_empty() || data == "[DONE]" {
                            continue;
                        }
                        match JsonRpcMessage::from_str(data) {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "SSE: failed to parse message"),
                        }
                    }
                    Ok(Event::Open) => tracing::debug!("SSE connection opened"),
                    Err(e) => {
                        tracing::warn!(error = %e, "SSE connection error");
                        break;
                    }
                }
            }
        });

        *self.sse_task.lock().await = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<(), McpClientError> {
        let mut builder = self.client.post(&self.url).header("Content-Type", "application/json");
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let body = serde_json::to_string(request)
            .map_err(|e| McpClientError::Protocol(format!("failed to serialize request: {e}")))?;
        let resp = builder
            .body(body)
            .send()
            .await
            .map_err(|e| McpClientError::Transport(format!("HTTP POST failed: {e}")))?;

        if matches!(
            resp.status(),
            reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN
        ) {
            return Err(McpClientError::Unauthorized);
        }
        if !resp.status().is_success() {
            return Err(McpClientError::Transport(format!("HTTP {} from server", resp.status())));
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, McpClientError> {
        Ok(self.response_rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), McpClientError> {
        if let Some(handle) = self.sse_task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }
}
