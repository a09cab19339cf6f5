//! Plugin Instance (spec §3, §4.G, §5): the engine-side state for one
//! running plugin process — its reader task, its two pending-request
//! tables, and the watchdog that shares its lifetime.
//!
//! The reader/writer/watchdog split into separate `tokio::spawn`ed tasks
//! sharing one `Arc<PluginInstance>` mirrors the teacher's one-`Arc`-per-
//! resource sharing style (`PluginSubprocess` shared as `Arc<PluginSubprocess>`
//! across its reader loop and caller-facing `call()`) rather than a central
//! actor mailbox. The pending-request table is the same
//! `Arc<Mutex<HashMap<u64, oneshot::Sender<_>>>>` shape the teacher uses in
//! its MCP `HttpTransport`/`SseTransport` response channel.
//!
//! Two tables, not one, because `input` is the one request class that gets
//! *both* an immediate RPC response (the ack) *and* a later terminal
//! notification sharing the same id (spec §4.D): `pending_calls` resolves
//! single-shot request/response pairs (`initialize`, `ping`, the `input`
//! ack); `dispatches` aggregates the `stream`/`complete`/`error`
//! notifications an `execute` or `input` eventually produces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rise_core::bus::{Bus, PLUGIN_TERMINATED, PLUGIN_WATCHDOG_KILLED};
use rise_core::ids::RequestIdAllocator;
use rise_protocol::frame;
use rise_protocol::manifest::Manifest;
use rise_protocol::rpc::{parse_message, ErrorCode, RpcMessage};
use rise_supervisor::{PluginProcess, SpawnSpec, SupervisorError};
use serde_json::Value;
use tokio::process::ChildStdout;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::watchdog::MissCounter;

#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("plugin `{0}` did not respond in time")]
    Timeout(String),

    #[error("plugin `{0}` is not ready to accept requests")]
    NotReady(String),

    #[error("plugin `{0}` rejected the request: {1}")]
    Rejected(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Loaded,
    Starting,
    Ready,
    Executing,
    AwaitingInput,
    ShuttingDown,
    Terminated,
}

/// Outcome of a completed `execute`/`input` dispatch, delivered once via
/// [`DispatchHandle::result`].
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Complete { success: bool, data: Value, keep_session: bool },
    Error { code: i64, message: String },
}

/// Handle returned to the engine's dispatch caller: a live stream of
/// `stream` notification payloads, in emission order, followed eventually
/// by exactly one terminal outcome.
pub struct DispatchHandle {
    pub stream: mpsc::UnboundedReceiver<Value>,
    pub result: oneshot::Receiver<DispatchOutcome>,
}

struct DispatchSlot {
    stream_tx: mpsc::UnboundedSender<Value>,
    result_tx: Option<oneshot::Sender<DispatchOutcome>>,
}

/// One running plugin. Reader, watchdog, and every dispatch call share this
/// behind an `Arc`; nothing outside this module writes to the process's
/// stdin directly (spec §5 "each plugin's stdin and stdout are owned
/// exclusively by its supervisor").
pub struct PluginInstance {
    pub name: String,
    pub manifest: RwLock<Manifest>,
    process: RwLock<Option<Arc<PluginProcess>>>,
    state: RwLock<InstanceState>,
    ids: RequestIdAllocator,
    pending_calls: Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>,
    dispatches: Mutex<HashMap<u64, DispatchSlot>>,
    miss_counter: Mutex<MissCounter>,
    last_pong: Mutex<Instant>,
    bus: Arc<Bus>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl PluginInstance {
    /// Spawn the plugin process, start its reader task, and send
    /// `initialize` bounded by `t_init`. On failure the instance is left in
    /// the `Terminated` state and the error is returned — per spec §7,
    /// "errors during initialize fail the plugin's startup... the engine
    /// continues" (with whatever other plugins discovery found).
    pub async fn start(
        manifest: Manifest,
        spec: SpawnSpec,
        bus: Arc<Bus>,
        t_init: Duration,
    ) -> Result<Arc<Self>, InstanceError> {
        let name = spec.name.clone();
        let (process, stdout) = PluginProcess::spawn(spec).await?;

        let instance = Arc::new(Self {
            name: name.clone(),
            manifest: RwLock::new(manifest),
            process: RwLock::new(Some(Arc::new(process))),
            state: RwLock::new(InstanceState::Starting),
            ids: RequestIdAllocator::new(),
            pending_calls: Mutex::new(HashMap::new()),
            dispatches: Mutex::new(HashMap::new()),
            miss_counter: Mutex::new(MissCounter::default()),
            last_pong: Mutex::new(Instant::now()),
            bus,
            reader_task: Mutex::new(None),
            watchdog_task: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });

        let reader = tokio::spawn(run_reader(Arc::clone(&instance), stdout));
        *instance.reader_task.lock().await = Some(reader);

        let init_params = serde_json::json!({"protocol_version": "2.0"});
        match instance.call("initialize", Some(init_params), t_init).await {
            Ok(RpcMessage::Response { error: Some(err), .. }) => {
                instance.mark_terminated().await;
                Err(InstanceError::Rejected(name, err.message))
            }
            Ok(_) => {
                *instance.state.write().await = InstanceState::Ready;
                Ok(instance)
            }
            Err(e) => {
                instance.mark_terminated().await;
                Err(e)
            }
        }
    }

    /// Attach (or replace) the watchdog task for this instance. Separate
    /// from `start` so the engine can choose ping cadence per-plugin from
    /// `tether_config` after the instance exists. `heartbeat_timeout`, when
    /// the manifest declares one, is an absolute cap on time since the last
    /// successful pong, enforced independently of the miss counter.
    pub async fn spawn_watchdog(self: &Arc<Self>, ping_interval: Duration, t_pong: Duration, heartbeat_timeout: Option<Duration>) {
        *self.last_pong.lock().await = Instant::now();
        let instance = Arc::clone(self);
        let handle = tokio::spawn(run_watchdog(instance, ping_interval, t_pong, heartbeat_timeout));
        *self.watchdog_task.lock().await = Some(handle);
    }

    pub async fn state(&self) -> InstanceState {
        *self.state.read().await
    }

    pub async fn has_exited(&self) -> bool {
        match self.process.read().await.as_ref() {
            Some(process) => process.has_exited().await,
            None => true,
        }
    }

    /// Single-shot request/response call (`initialize`, `ping`). Not used
    /// for `execute`/`input`, whose terminal result arrives as a
    /// notification instead — see [`Self::dispatch`].
    async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<RpcMessage, InstanceError> {
        let process = self.process.read().await.clone().ok_or_else(|| InstanceError::NotReady(self.name.clone()))?;
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending_calls.lock().await.insert(id, tx);

        let request = RpcMessage::request(id, method, params);
        if process.writer().send(&request.to_value()).await.is_err() {
            self.pending_calls.lock().await.remove(&id);
            return Err(InstanceError::NotReady(self.name.clone()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            _ => {
                self.pending_calls.lock().await.remove(&id);
                Err(InstanceError::Timeout(self.name.clone()))
            }
        }
    }

    /// Issue `execute {function, arguments}` (spec §6). No RPC response is
    /// awaited here: the plugin SDK never answers `execute` with a
    /// `Response`, only eventually with a `stream`*/`complete`|`error`
    /// notification sequence, which `DispatchHandle` exposes. `t_exec` is
    /// the soft deadline (spec §5): if no terminal notification for this
    /// call arrives within it, the plugin is killed and the caller is
    /// handed a `Timeout` outcome — the protocol has no cancel RPC, so a
    /// stuck `execute` can only be recovered by terminating the process.
    pub async fn dispatch_execute(self: &Arc<Self>, function: &str, arguments: Value, t_exec: Duration) -> Result<DispatchHandle, InstanceError> {
        if self.state().await == InstanceState::Terminated {
            return Err(InstanceError::NotReady(self.name.clone()));
        }
        let process = self.process.read().await.clone().ok_or_else(|| InstanceError::NotReady(self.name.clone()))?;
        let id = self.ids.next();
        let handle = self.register_dispatch(id).await;

        let params = serde_json::json!({"function": function, "arguments": arguments});
        let request = RpcMessage::request(id, "execute", Some(params));
        if process.writer().send(&request.to_value()).await.is_err() {
            self.dispatches.lock().await.remove(&id);
            return Err(InstanceError::NotReady(self.name.clone()));
        }

        *self.state.write().await = InstanceState::Executing;
        self.spawn_exec_deadline(id, t_exec);
        Ok(handle)
    }

    /// Issue `input {content}` to a plugin that currently owns the session
    /// (spec §4.D, §4.H). Waits for the immediate ack (bounded by `t_ack`)
    /// before returning the dispatch handle for the eventual terminal
    /// notification; a missing or negative ack is surfaced immediately
    /// rather than left to the stream. Once acked, `t_exec` bounds the wait
    /// for the terminal notification, same as `execute` (spec §5: "`input`
    /// ... reuses `T_exec` for completion").
    pub async fn dispatch_input(self: &Arc<Self>, content: &str, t_ack: Duration, t_exec: Duration) -> Result<DispatchHandle, InstanceError> {
        if self.state().await == InstanceState::Terminated {
            return Err(InstanceError::NotReady(self.name.clone()));
        }
        let process = self.process.read().await.clone().ok_or_else(|| InstanceError::NotReady(self.name.clone()))?;
        let id = self.ids.next();

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_calls.lock().await.insert(id, ack_tx);
        let handle = self.register_dispatch(id).await;

        let params = serde_json::json!({"content": content});
        let request = RpcMessage::request(id, "input", Some(params));
        if process.writer().send(&request.to_value()).await.is_err() {
            self.pending_calls.lock().await.remove(&id);
            self.dispatches.lock().await.remove(&id);
            return Err(InstanceError::NotReady(self.name.clone()));
        }

        match tokio::time::timeout(t_ack, ack_rx).await {
            Ok(Ok(RpcMessage::Response { error: Some(err), .. })) => {
                self.dispatches.lock().await.remove(&id);
                return Err(InstanceError::Rejected(self.name.clone(), err.message));
            }
            Ok(Ok(_)) => {}
            _ => {
                self.pending_calls.lock().await.remove(&id);
                self.dispatches.lock().await.remove(&id);
                return Err(InstanceError::Timeout(self.name.clone()));
            }
        }

        *self.state.write().await = InstanceState::AwaitingInput;
        self.spawn_exec_deadline(id, t_exec);
        Ok(handle)
    }

    /// Spawn the per-dispatch `t_exec` watchdog: if dispatch `id` is still
    /// pending after `deadline`, remove its slot, surface a `Timeout`
    /// outcome, and kill the whole plugin process (spec §5's "no cancel
    /// RPC" rule — see `dispatch_execute`'s doc comment).
    fn spawn_exec_deadline(self: &Arc<Self>, id: u64, deadline: Duration) {
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let slot = instance.dispatches.lock().await.remove(&id);
            let Some(mut slot) = slot else { return };

            if let Some(tx) = slot.result_tx.take() {
                let _ = tx.send(DispatchOutcome::Error {
                    code: ErrorCode::Timeout.code(),
                    message: "the plugin did not respond".to_string(),
                });
            }
            tracing::warn!(plugin = %instance.name, id, "execute/input exceeded t_exec, killing plugin");
            let _ = instance.kill().await;
            instance
                .bus
                .publish(&PLUGIN_WATCHDOG_KILLED, serde_json::json!({"plugin": instance.name}))
                .await;
        });
    }

    async fn register_dispatch(&self, id: u64) -> DispatchHandle {
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.dispatches.lock().await.insert(id, DispatchSlot { stream_tx, result_tx: Some(result_tx) });
        DispatchHandle { stream: stream_rx, result: result_rx }
    }

    /// Graceful-then-forced shutdown delegated to the supervisor (spec
    /// §4.F), after which the instance is marked `Terminated` and every
    /// still-pending call/dispatch is surfaced a `Timeout` so no caller
    /// waits forever.
    pub async fn shutdown(&self, t_graceful: Duration, t_force: Duration) -> Result<(), InstanceError> {
        *self.state.write().await = InstanceState::ShuttingDown;
        if let Some(process) = self.process.read().await.as_ref() {
            process.shutdown(t_graceful, t_force).await?;
        }
        self.mark_terminated().await;
        Ok(())
    }

    /// Immediate kill with no shutdown notice — the watchdog path (spec
    /// §4.I) and cancelled-deadline path both call this directly.
    async fn kill(&self) -> Result<(), InstanceError> {
        if let Some(process) = self.process.read().await.as_ref() {
            process.kill().await?;
        }
        self.mark_terminated().await;
        Ok(())
    }

    async fn mark_terminated(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.write().await = InstanceState::Terminated;
        if let Some(handle) = self.watchdog_task.lock().await.take() {
            handle.abort();
        }

        let timeout_err = DispatchOutcome::Error { code: ErrorCode::Timeout.code(), message: "plugin terminated".to_string() };
        let mut dispatches = self.dispatches.lock().await;
        for (_, mut slot) in dispatches.drain() {
            if let Some(tx) = slot.result_tx.take() {
                let _ = tx.send(timeout_err.clone());
            }
        }
        drop(dispatches);
        self.pending_calls.lock().await.clear();

        self.bus
            .publish(&PLUGIN_TERMINATED, serde_json::json!({"plugin": self.name}))
            .await;
    }
}

async fn run_reader(instance: Arc<PluginInstance>, mut stdout: ChildStdout) {
    loop {
        let raw = match frame::decode(&mut stdout).await {
            Ok(value) => value,
            Err(frame::FrameError::UnexpectedEof) => break,
            Err(e) => {
                tracing::warn!(plugin = %instance.name, error = %e, "dropping malformed frame from plugin");
                continue;
            }
        };

        let message = match parse_message(&raw) {
            Ok(message) => message,
            Err(_) => {
                tracing::warn!(plugin = %instance.name, "dropping invalid envelope from plugin");
                continue;
            }
        };

        match message {
            RpcMessage::Response { id, .. } => {
                if let Some(tx) = instance.pending_calls.lock().await.remove(&id) {
                    let _ = tx.send(message);
                } else {
                    tracing::warn!(plugin = %instance.name, id, "dropping response with unknown id");
                }
            }
            RpcMessage::Notification { method, params, .. } => {
                handle_notification(&instance, &method, params).await;
            }
            RpcMessage::Request { id, method, .. } => {
                tracing::warn!(plugin = %instance.name, id, method, "plugin sent an unsupported engine-bound request");
            }
        }
    }

    instance.mark_terminated().await;
}

async fn handle_notification(instance: &Arc<PluginInstance>, method: &str, params: Option<Value>) {
    let params = params.unwrap_or(Value::Null);

    match method {
        "stream" => {
            let Some(id) = params.get("request_id").and_then(Value::as_u64) else { return };
            let dispatches = instance.dispatches.lock().await;
            match dispatches.get(&id) {
                Some(slot) => {
                    let _ = slot.stream_tx.send(params.get("data").cloned().unwrap_or(Value::Null));
                }
                None => {
                    tracing::debug!(plugin = %instance.name, id, "dropping stream chunk for completed/unknown request");
                }
            }
        }
        "complete" => {
            let Some(id) = params.get("request_id").and_then(Value::as_u64) else { return };
            let Some(mut slot) = instance.dispatches.lock().await.remove(&id) else { return };
            if let Some(tx) = slot.result_tx.take() {
                let outcome = DispatchOutcome::Complete {
                    success: params.get("success").and_then(Value::as_bool).unwrap_or(true),
                    data: params.get("data").cloned().unwrap_or(Value::Null),
                    keep_session: params.get("keep_session").and_then(Value::as_bool).unwrap_or(false),
                };
                let _ = tx.send(outcome);
            }
            *instance.state.write().await = InstanceState::Ready;
        }
        "error" => {
            let Some(id) = params.get("request_id").and_then(Value::as_u64) else { return };
            let Some(mut slot) = instance.dispatches.lock().await.remove(&id) else { return };
            if let Some(tx) = slot.result_tx.take() {
                let outcome = DispatchOutcome::Error {
                    code: params.get("code").and_then(Value::as_i64).unwrap_or(ErrorCode::PluginError.code()),
                    message: params.get("message").and_then(Value::as_str).unwrap_or("plugin error").to_string(),
                };
                let _ = tx.send(outcome);
            }
            *instance.state.write().await = InstanceState::Ready;
        }
        "log" => {
            let level = params.get("level").and_then(Value::as_str).unwrap_or("info");
            let message = params.get("message").and_then(Value::as_str).unwrap_or_default();
            tracing::info!(plugin = %instance.name, level, "[plugin-log] {message}");
        }
        other => {
            tracing::debug!(plugin = %instance.name, method = other, "ignoring unrecognised notification");
        }
    }
}

async fn run_watchdog(instance: Arc<PluginInstance>, ping_interval: Duration, t_pong: Duration, heartbeat_timeout: Option<Duration>) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if instance.state().await == InstanceState::Terminated {
            break;
        }

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let result = instance.call("ping", Some(serde_json::json!({"timestamp": timestamp})), t_pong).await;

        let mut counter = instance.miss_counter.lock().await;
        let tripped = match result {
            Ok(_) => {
                counter.record_pong();
                *instance.last_pong.lock().await = Instant::now();
                false
            }
            Err(_) => counter.record_miss(),
        };
        drop(counter);

        let overdue = match heartbeat_timeout {
            Some(timeout) => instance.last_pong.lock().await.elapsed() >= timeout,
            None => false,
        };

        if tripped || overdue {
            let reason = if overdue { "heartbeat_timeout elapsed" } else { "missed too many pongs" };
            tracing::warn!(plugin = %instance.name, reason, "watchdog killing plugin");
            let _ = instance.kill().await;
            instance
                .bus
                .publish(&PLUGIN_WATCHDOG_KILLED, serde_json::json!({"plugin": instance.name}))
                .await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    fn default_manifest(name: &str) -> Manifest {
        let body = serde_json::json!({
            "manifestVersion": 1,
            "name": name,
            "version": "1.0.0",
            "description": "test plugin",
            "executable": "plugin.py",
            "persistent": true,
            "protocol_version": "2.0",
            "functions": [{"name": "do_it", "description": "", "tags": [], "properties": {}, "required": []}]
        });
        Manifest::parse(&body.to_string()).unwrap()
    }

    /// Writes a python3 fake plugin speaking the 4-byte-length-prefixed
    /// frame codec directly (`rise_protocol::frame`'s wire format), not the
    /// SDK's own dispatch loop, so a test can script exactly which
    /// requests get answered and which are left to dangle.
    fn write_fake_plugin(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("plugin.py");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/usr/bin/env python3").unwrap();
        writeln!(f, "import sys, json, struct").unwrap();
        writeln!(f, "def send(msg):").unwrap();
        writeln!(f, "    payload = json.dumps(msg).encode('utf-8')").unwrap();
        writeln!(f, "    sys.stdout.buffer.write(struct.pack('>I', len(payload)))").unwrap();
        writeln!(f, "    sys.stdout.buffer.write(payload)").unwrap();
        writeln!(f, "    sys.stdout.buffer.flush()").unwrap();
        writeln!(f, "def recv():").unwrap();
        writeln!(f, "    raw = sys.stdin.buffer.read(4)").unwrap();
        writeln!(f, "    if len(raw) < 4: sys.exit(0)").unwrap();
        writeln!(f, "    n = struct.unpack('>I', raw)[0]").unwrap();
        writeln!(f, "    return json.loads(sys.stdin.buffer.read(n))").unwrap();
        f.write_all(body.as_bytes()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    async fn start_instance(dir: &Path, name: &str, script: &str) -> Arc<PluginInstance> {
        let script_path = write_fake_plugin(dir, script);
        let spec = SpawnSpec::new(name, script_path, dir.to_path_buf());
        PluginInstance::start(default_manifest(name), spec, Arc::new(Bus::new()), Duration::from_secs(2))
            .await
            .unwrap()
    }

    const RESPOND_TO_INITIALIZE: &str = r#"
msg = recv()
send({"jsonrpc": "2.0", "id": msg["id"], "result": {"ready": True}})
"#;

    #[tokio::test]
    async fn starts_and_reaches_ready_on_a_well_behaved_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let instance = start_instance(dir.path(), "good", RESPOND_TO_INITIALIZE).await;
        assert_eq!(instance.state().await, InstanceState::Ready);
    }

    #[tokio::test]
    async fn start_fails_and_marks_terminated_when_initialize_is_never_answered() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = write_fake_plugin(dir.path(), "import time\ntime.sleep(5)\n");
        let spec = SpawnSpec::new("silent", script_path, dir.path().to_path_buf());

        let err = PluginInstance::start(default_manifest("silent"), spec, Arc::new(Bus::new()), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::Timeout(_)));
    }

    #[tokio::test]
    async fn dispatch_execute_past_t_exec_times_out_and_kills_the_plugin() {
        let dir = tempfile::tempdir().unwrap();
        // Answers initialize, then never emits stream/complete/error for execute.
        let script = format!("{RESPOND_TO_INITIALIZE}\nrecv()\nimport time\ntime.sleep(5)\n");
        let instance = start_instance(dir.path(), "hangs", &script).await;

        let mut handle = instance.dispatch_execute("do_it", Value::Null, Duration::from_millis(100)).await.unwrap();
        let outcome = handle.result.await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Error { code, .. } if code == ErrorCode::Timeout.code()));
        assert!(handle.stream.recv().await.is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(instance.state().await, InstanceState::Terminated);
    }

    #[tokio::test]
    async fn dispatch_execute_completes_normally_within_t_exec() {
        let dir = tempfile::tempdir().unwrap();
        let script = format!(
            "{RESPOND_TO_INITIALIZE}\n\
             msg = recv()\n\
             send({{'jsonrpc': '2.0', 'method': 'complete', 'params': {{'request_id': msg['id'], 'success': True, 'data': {{'ok': True}}, 'keep_session': False}}}})\n"
        );
        let instance = start_instance(dir.path(), "fast", &script).await;

        let handle = instance.dispatch_execute("do_it", Value::Null, Duration::from_secs(5)).await.unwrap();
        let outcome = handle.result.await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Complete { success: true, .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(instance.state().await, InstanceState::Ready);
    }
}
