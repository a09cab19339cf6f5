//! Process Supervisor (spec §4.F): owns one plugin's OS-level child process
//! — spawning it with the manifest's executable, piping stdin/stdout as the
//! frame-codec transport, capturing stderr into the tracing log, and
//! running the graceful-then-forced shutdown sequence.
//!
//! Grounded directly on `PluginSubprocess::spawn`/`shutdown`/`reconnect`:
//! the same `Stdio::piped()` + `kill_on_drop(true)` spawn shape and the
//! same rate-limited stderr forwarder. Unlike the teacher's in-place
//! `reconnect()`, a killed plugin here isn't resurrected in place — the
//! engine spawns an entirely fresh [`PluginInstance`](../rise_engine/struct.PluginInstance.html)
//! against the same manifest on its next dispatch instead, so a restart
//! never has to untangle a half-reset reader task or pending-request table.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rise_core::process_registry::{global_registry, ProcessKind};
use rise_protocol::frame::FrameWriter;
use rise_protocol::rpc::RpcMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Grace period the host waits after sending `shutdown` before killing.
pub const T_GRACEFUL: Duration = Duration::from_secs(2);
/// Additional wait after a forced kill signal before giving up.
pub const T_FORCE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn `{executable}`: {source}")]
    Spawn { executable: String, #[source] source: std::io::Error },

    #[error("plugin process exposed no stdin pipe")]
    NoStdin,

    #[error("plugin process exposed no stdout pipe")]
    NoStdout,

    #[error("plugin process is not running")]
    NotRunning,

    #[error(transparent)]
    Frame(#[from] rise_protocol::frame::FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What's needed to (re)spawn a plugin's process, kept around so
/// [`PluginProcess::restart`] can respawn identically to the first spawn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub name: String,
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            working_dir: working_dir.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.current_dir(&self.working_dir)
            .env("RISE_PLUGIN_DIR", &self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// One running (or recently-running) plugin process. Owns the exclusive
/// write half of its stdin (wrapped in the shared [`FrameWriter`] codec) and
/// hands the read half to the caller once, at spawn time — per spec §5,
/// "each plugin's stdin and stdout are owned exclusively by its supervisor;
/// no other component writes to them", the engine's reader task borrows
/// stdout but the supervisor remains the only writer.
pub struct PluginProcess {
    spec: SpawnSpec,
    child: Mutex<Option<Child>>,
    writer: Arc<FrameWriter<ChildStdin>>,
    pid: u32,
}

impl PluginProcess {
    /// Spawn the process described by `spec`. Returns the process handle
    /// plus the stdout half for the caller's reader task — there is
    /// intentionally no accessor for it later, spawning is the one moment
    /// it changes hands.
    pub async fn spawn(spec: SpawnSpec) -> Result<(Self, ChildStdout), SupervisorError> {
        let mut child = spec.command().spawn().map_err(|e| SupervisorError::Spawn {
            executable: spec.executable.display().to_string(),
            source: e,
        })?;

        let pid = child.id().unwrap_or(0);

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(spec.name.clone(), stderr));
        }

        let stdin = child.stdin.take().ok_or(SupervisorError::NoStdin)?;
        let stdout = child.stdout.take().ok_or(SupervisorError::NoStdout)?;

        global_registry().register(pid, spec.name.clone(), ProcessKind::Plugin);

        let process = Self {
            spec,
            child: Mutex::new(Some(child)),
            writer: Arc::new(FrameWriter::new(stdin)),
            pid,
        };

        Ok((process, stdout))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Shared handle to the frame-codec writer over this process's stdin.
    pub fn writer(&self) -> Arc<FrameWriter<ChildStdin>> {
        Arc::clone(&self.writer)
    }

    /// Graceful-then-forced shutdown (spec §4.F): send the `shutdown`
    /// notification, wait `t_graceful` for the process to exit on its own,
    /// then send a kill signal and wait `t_force` before giving up (the OS
    /// reaps a `kill_on_drop` child regardless once we drop it).
    pub async fn shutdown(&self, t_graceful: Duration, t_force: Duration) -> Result<(), SupervisorError> {
        global_registry().unregister(self.pid);

        let _ = self.writer.send(&RpcMessage::notification("shutdown", None).to_value()).await;

        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };

        if tokio::time::timeout(t_graceful, child.wait()).await.is_ok() {
            return Ok(());
        }

        tracing::warn!(plugin = %self.spec.name, "plugin did not exit after shutdown notice, killing");
        let _ = child.start_kill();
        let _ = tokio::time::timeout(t_force, child.wait()).await;
        Ok(())
    }

    /// Immediate, non-negotiable termination — the watchdog path (spec
    /// §4.I) calls this directly, with no `shutdown` notice first, since a
    /// plugin that's missed two pongs cannot be trusted to react to one.
    pub async fn kill(&self) -> Result<(), SupervisorError> {
        global_registry().unregister(self.pid);
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        *guard = None;
        Ok(())
    }

    /// True once the child has exited, without blocking to find out.
    pub async fn has_exited(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }
}

async fn forward_stderr(plugin_name: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    let mut count = 0u64;
    let mut window_start = tokio::time::Instant::now();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let msg = line.trim_end();
                if msg.is_empty() {
                    continue;
                }
                if window_start.elapsed() > Duration::from_secs(1) {
                    count = 0;
                    window_start = tokio::time::Instant::now();
                }
                count += 1;
                if count <= 20 {
                    tracing::warn!(plugin = %plugin_name, "[plugin-stderr] {msg}");
                }
            }
            Err(error) => {
                tracing::debug!(plugin = %plugin_name, %error, "failed to read plugin stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("plugin.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
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

    #[tokio::test]
    async fn spawn_exposes_stdin_and_stdout_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "cat > /dev/null\n");
        let spec = SpawnSpec::new("echoer", script, dir.path());

        let (process, _stdout) = PluginProcess::spawn(spec).await.unwrap();
        assert_eq!(process.name(), "echoer");
        assert!(process.pid() > 0);
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_reaps_a_process_that_exits_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 0.05\nexit 0\n");
        let spec = SpawnSpec::new("quick-exit", script, dir.path());

        let (process, _stdout) = PluginProcess::spawn(spec).await.unwrap();
        process.shutdown(Duration::from_millis(500), Duration::from_millis(500)).await.unwrap();
        assert!(process.has_exited().await);
    }

    #[tokio::test]
    async fn shutdown_force_kills_a_process_that_ignores_the_notice() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "while true; do sleep 1; done\n");
        let spec = SpawnSpec::new("stubborn", script, dir.path());

        let (process, _stdout) = PluginProcess::spawn(spec).await.unwrap();
        process.shutdown(Duration::from_millis(100), Duration::from_millis(500)).await.unwrap();
        assert!(process.has_exited().await);
    }
}
