//! Engine Core (spec §4.G): discovery, startup, dispatch routing, and
//! manifest reload, tying together the catalogue, session controller,
//! process supervisor, and manifest watcher.
//!
//! Grounded on `PluginLoader` (discovery/load_all/shutdown_all shape)
//! generalized from "spawn one TS host process per plugin spec" to "spawn
//! one plugin process per discovered manifest", and on `rocode-server`'s
//! dispatch style: request arrives, resolve target, await a
//! bounded-timeout response, forward.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rise_core::bus::{Bus, MANIFEST_RELOADED, PLUGIN_STARTED, PLUGIN_TERMINATED, PLUGIN_WATCHDOG_KILLED, SESSION_OWNER_CHANGED};
use rise_protocol::manifest::Manifest;
use rise_supervisor::SpawnSpec;
use rise_watcher::{ManifestChange, ManifestWatcher, ManifestWatcherConfig};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::catalogue::{CatalogueBuilder, CatalogueHandle};
use crate::config::EngineConfig;
use crate::instance::{DispatchHandle, DispatchOutcome, InstanceError, InstanceState, PluginInstance};
use crate::session::{Route, SessionController};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("no owned session and no function name given")]
    MissingFunction,

    #[error("plugin `{0}` is not running")]
    PluginNotRunning(String),

    #[error("failed to read plugins directory {0}: {1}")]
    Discovery(PathBuf, std::io::Error),
}

pub struct PluginDescriptor {
    pub plugin_dir: PathBuf,
    pub manifest: Manifest,
}

/// Result of a single `discover_and_start` pass: which plugins came up and
/// which failed, so the caller (the host binary) can log failures without
/// discovery itself aborting (spec §4.G step 2: "failures are recorded but
/// do not abort overall startup").
pub struct StartupReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, EngineError)>,
}

/// A dispatched turn's handle plus the plugin it was sent to. The caller
/// drains `handle.stream` and `handle.result` and then MUST call
/// [`Engine::record_dispatch_outcome`] with the terminal outcome, so
/// session ownership (spec §4.H) stays in sync regardless of what the
/// caller does with the stream itself.
pub struct Dispatch {
    pub plugin: String,
    pub handle: DispatchHandle,
}

pub struct Engine {
    config: EngineConfig,
    bus: Arc<Bus>,
    catalogue: CatalogueHandle,
    session: SessionController,
    instances: RwLock<HashMap<String, Arc<PluginInstance>>>,
    /// Directory + last-known manifest for every discovered plugin,
    /// persistent or not — lets [`Self::instance_for_dispatch`] spawn a
    /// lazy (non-persistent) plugin on its first dispatch, and respawn any
    /// plugin the watchdog or a deadline killed, per spec §4.F's restart
    /// policy ("the next `execute` for that plugin triggers a fresh spawn").
    descriptors: RwLock<HashMap<String, (PathBuf, Manifest)>>,
    watcher: Arc<ManifestWatcher>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, rise_watcher::WatcherError> {
        let watcher = Arc::new(ManifestWatcher::new(ManifestWatcherConfig { debounce: config.manifest_debounce })?);
        let session = SessionController::new(config.t_session);
        let engine = Arc::new(Self {
            config,
            bus: Arc::new(Bus::new()),
            catalogue: CatalogueHandle::default(),
            session,
            instances: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(HashMap::new()),
            watcher,
        });
        tokio::spawn(run_reload_listener(Arc::clone(&engine)));
        tokio::spawn(run_termination_listener(Arc::clone(&engine)));
        Ok(engine)
    }

    pub fn bus(&self) -> Arc<Bus> {
        Arc::clone(&self.bus)
    }

    /// Scan `plugins_dir` for subdirectories containing a valid
    /// `manifest.json` (spec §4.G step 1), spawn every `persistent` plugin
    /// and every `mcp.launch_on_startup` plugin (step 3, with a grace
    /// period then manifest re-read), and publish the resulting catalogue.
    pub async fn discover_and_start(self: &Arc<Self>) -> Result<StartupReport, EngineError> {
        let descriptors = discover(&self.config.plugins_dir)?;
        let mut started = Vec::new();
        let mut failed = Vec::new();
        let mut builder = CatalogueBuilder::new();

        for descriptor in descriptors {
            let PluginDescriptor { plugin_dir, mut manifest } = descriptor;
            let name = manifest.name.clone();
            let launch_mcp = manifest.mcp.as_ref().is_some_and(|m| m.launch_on_startup);

            self.descriptors.write().await.insert(name.clone(), (plugin_dir.clone(), manifest.clone()));

            if !manifest.persistent && !launch_mcp {
                // Non-persistent, non-MCP plugins are spawned lazily on
                // first dispatch (spec §4.F "spawns on demand anyway").
                builder.add_plugin(&name, &manifest.functions);
                if self.watcher.watch_plugin_dir(&plugin_dir).is_err() {
                    tracing::debug!(plugin_dir = %plugin_dir.display(), "manifest watcher already watching this directory");
                }
                continue;
            }

            match self.start_plugin(&plugin_dir, manifest.clone()).await {
                Ok(_) => {
                    if launch_mcp {
                        tokio::time::sleep(self.config.mcp_launch_grace).await;
                        if let Ok(reloaded) = Manifest::load_file(&plugin_dir.join("manifest.json")) {
                            manifest = reloaded;
                            if let Some(instance) = self.instances.read().await.get(&name) {
                                *instance.manifest.write().await = manifest.clone();
                            }
                            self.descriptors.write().await.insert(name.clone(), (plugin_dir.clone(), manifest.clone()));
                        }
                    }
                    builder.add_plugin(&name, &manifest.functions);
                    started.push(name);
                }
                Err(e) => failed.push((name, e)),
            }

            if self.watcher.watch_plugin_dir(&plugin_dir).is_err() {
                tracing::debug!(plugin_dir = %plugin_dir.display(), "manifest watcher already watching this directory");
            }
        }

        self.catalogue.publish(builder.build()).await;
        Ok(StartupReport { started, failed })
    }

    async fn start_plugin(self: &Arc<Self>, plugin_dir: &Path, manifest: Manifest) -> Result<Arc<PluginInstance>, EngineError> {
        let executable = resolve_executable(plugin_dir, &manifest.executable);
        let spec = SpawnSpec::new(manifest.name.clone(), executable, plugin_dir.to_path_buf());
        let t_init = self.config.init_timeout_for(manifest.tether_config.as_ref());
        let name = manifest.name.clone();

        let instance = PluginInstance::start(manifest.clone(), spec, self.bus(), t_init).await?;
        let ping_interval = self.config.ping_interval_for(manifest.tether_config.as_ref());
        let heartbeat_timeout = self.config.heartbeat_timeout_for(manifest.tether_config.as_ref());
        instance.spawn_watchdog(ping_interval, self.config.t_pong, heartbeat_timeout).await;

        self.instances.write().await.insert(name.clone(), Arc::clone(&instance));
        self.bus.publish(&PLUGIN_STARTED, serde_json::json!({"plugin": name})).await;
        Ok(instance)
    }

    /// Route and dispatch one user turn (spec §4.G step 4, §4.H). Resolves
    /// via the session controller first: an owned session always becomes
    /// an `input` call to the owner, bypassing function resolution
    /// entirely.
    pub async fn dispatch_turn(self: &Arc<Self>, function: Option<&str>, arguments: Value, raw_text: &str) -> Result<Dispatch, EngineError> {
        match self.session.route().await {
            Route::InputTo(plugin) => self.dispatch_input(&plugin, raw_text).await,
            Route::Execute => {
                let function = function.ok_or(EngineError::MissingFunction)?;
                self.dispatch_execute(function, arguments).await
            }
        }
    }

    async fn dispatch_execute(self: &Arc<Self>, function: &str, arguments: Value) -> Result<Dispatch, EngineError> {
        let snapshot = self.catalogue.snapshot().await;
        let entry = snapshot.resolve(function).ok_or_else(|| EngineError::UnknownFunction(function.to_string()))?;
        let plugin = entry.plugin.clone();
        drop(snapshot);

        let instance = self.instance_for_dispatch(&plugin).await?;
        let handle = instance.dispatch_execute(function, arguments, self.config.t_exec).await?;
        Ok(Dispatch { plugin, handle })
    }

    async fn dispatch_input(self: &Arc<Self>, plugin: &str, content: &str) -> Result<Dispatch, EngineError> {
        let instance = self.instance_for_dispatch(plugin).await?;
        let handle = instance.dispatch_input(content, self.config.t_ack, self.config.t_exec).await?;
        Ok(Dispatch { plugin: plugin.to_string(), handle })
    }

    /// Resolve the running instance to dispatch to, spawning one on demand
    /// when none is running yet (a lazy non-persistent plugin's first
    /// dispatch) or when the previously running one was terminated (spec
    /// §4.F: a watchdog kill or `t_exec` deadline leaves the plugin
    /// `Terminated`, and "the next `execute` for that plugin triggers a
    /// fresh spawn... regardless" of `persistent`). A plugin discovery never
    /// saw at all is still reported as [`EngineError::PluginNotRunning`].
    async fn instance_for_dispatch(self: &Arc<Self>, plugin: &str) -> Result<Arc<PluginInstance>, EngineError> {
        if let Some(instance) = self.instances.read().await.get(plugin).cloned() {
            if instance.state().await != InstanceState::Terminated {
                return Ok(instance);
            }
        }

        let (plugin_dir, manifest) = self
            .descriptors
            .read()
            .await
            .get(plugin)
            .cloned()
            .ok_or_else(|| EngineError::PluginNotRunning(plugin.to_string()))?;

        tracing::info!(plugin, "spawning plugin on demand for dispatch");
        self.start_plugin(&plugin_dir, manifest).await
    }

    /// Apply a completed dispatch's outcome to session ownership (spec
    /// §4.H) and the session-owner-changed bus event. Called by the
    /// engine's public dispatch wrappers once the caller has observed
    /// `DispatchOutcome`.
    pub async fn record_dispatch_outcome(&self, plugin: &str, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Complete { keep_session, .. } => {
                let keep_session = *keep_session
                    && match self.instances.read().await.get(plugin) {
                        Some(instance) => self
                            .config
                            .passthrough_allowed_for(instance.manifest.read().await.tether_config.as_ref()),
                        None => true,
                    };
                let was_owner = self.session.current_owner().await.as_deref() == Some(plugin);
                self.session.on_complete(plugin, keep_session).await;
                if was_owner != keep_session {
                    self.bus
                        .publish(&SESSION_OWNER_CHANGED, serde_json::json!({"plugin": plugin, "owned": keep_session}))
                        .await;
                }
            }
            DispatchOutcome::Error { .. } => {
                self.session.release_if_owner(plugin).await;
            }
        }
    }

    pub async fn shutdown_all(&self) {
        let instances: Vec<Arc<PluginInstance>> = self.instances.write().await.drain().map(|(_, v)| v).collect();
        for instance in instances {
            if let Err(e) = instance.shutdown(self.config.t_graceful, self.config.t_force).await {
                tracing::warn!(plugin = %instance.name, error = %e, "error during plugin shutdown");
            }
        }
        self.watcher.stop();
    }
}

fn resolve_executable(plugin_dir: &Path, executable: &str) -> PathBuf {
    let candidate = PathBuf::from(executable);
    if candidate.is_absolute() {
        candidate
    } else {
        plugin_dir.join(candidate)
    }
}

fn discover(plugins_dir: &Path) -> Result<Vec<PluginDescriptor>, EngineError> {
    let mut descriptors = Vec::new();
    let entries = std::fs::read_dir(plugins_dir).map_err(|e| EngineError::Discovery(plugins_dir.to_path_buf(), e))?;

    for entry in entries.flatten() {
        let plugin_dir = entry.path();
        if !plugin_dir.is_dir() {
            continue;
        }
        let manifest_path = plugin_dir.join("manifest.json");
        if !manifest_path.exists() {
            continue;
        }
        match Manifest::load_file(&manifest_path) {
            Ok(manifest) => descriptors.push(PluginDescriptor { plugin_dir, manifest }),
            Err(e) => tracing::warn!(manifest = %manifest_path.display(), error = %e, "skipping invalid manifest during discovery"),
        }
    }

    Ok(descriptors)
}

/// Background task folding [`rise_watcher::ManifestEvent`]s into the
/// catalogue (spec §4.G step 7, §4.J): on a valid reload the plugin's
/// routes are rebuilt and republished without touching its running
/// process; on an invalid reload the previous view is kept and the
/// rejection is logged.
async fn run_reload_listener(engine: Arc<Engine>) {
    let mut rx = engine.watcher.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        match event.change {
            ManifestChange::Updated(manifest) => {
                let name = manifest.name.clone();
                if let Some(instance) = engine.instances.read().await.get(&name) {
                    *instance.manifest.write().await = (*manifest).clone();
                }
                if let Some(entry) = engine.descriptors.write().await.get_mut(&name) {
                    entry.1 = (*manifest).clone();
                }

                let snapshot = engine.catalogue.snapshot().await;
                let mut builder = CatalogueBuilder::new();
                for entry in snapshot.functions() {
                    if entry.plugin != name {
                        builder.add_plugin(&entry.plugin, std::slice::from_ref(&entry.function));
                    }
                }
                builder.add_plugin(&name, &manifest.functions);
                engine.catalogue.publish(builder.build()).await;

                engine
                    .bus
                    .publish(&MANIFEST_RELOADED, serde_json::json!({"plugin": name}))
                    .await;
            }
            ManifestChange::Invalid(reason) => {
                tracing::warn!(plugin_dir = %event.plugin_dir.display(), reason, "manifest reload rejected, keeping previous catalogue view");
            }
        }
    }
}

/// Background task enforcing §4.H transition (d): "the owner terminates for
/// any reason" always releases session ownership, independent of whatever
/// `keep_session` its last completion carried. Listens on the bus rather
/// than being called directly from `instance.rs::mark_terminated` so the
/// instance module stays ignorant of session-controller state.
async fn run_termination_listener(engine: Arc<Engine>) {
    let mut rx = engine.bus.subscribe_channel();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        if event.event_type != PLUGIN_TERMINATED.event_type && event.event_type != PLUGIN_WATCHDOG_KILLED.event_type {
            continue;
        }
        let Some(plugin) = event.properties.get("plugin").and_then(Value::as_str) else { continue };
        if engine.session.current_owner().await.as_deref() == Some(plugin) {
            engine.session.release_if_owner(plugin).await;
            engine
                .bus
                .publish(&SESSION_OWNER_CHANGED, serde_json::json!({"plugin": plugin, "owned": false}))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, name: &str, persistent: bool) {
        let body = serde_json::json!({
            "manifestVersion": 1,
            "name": name,
            "version": "1.0.0",
            "description": "test plugin",
            "executable": "plugin.sh",
            "persistent": persistent,
            "protocol_version": "2.0",
            "functions": [{"name": format!("{name}_fn"), "description": "", "tags": [], "properties": {}, "required": []}]
        });
        std::fs::write(dir.join("manifest.json"), serde_json::to_string_pretty(&body).unwrap()).unwrap();
    }

    /// Writes a non-persistent plugin whose manifest declares one function
    /// (`<name>_fn`) and a python3 executable that answers `initialize` then
    /// completes one `execute` call and exits, so each dispatch spawns a
    /// fresh process — used to exercise lazy spawn-on-demand (spec §4.F).
    fn write_lazy_plugin(dir: &Path, name: &str) {
        write_manifest(dir, name, false);
        let script_path = dir.join("plugin.py");
        let body = r#"#!/usr/bin/env python3
import sys, json, struct

def send(msg):
    payload = json.dumps(msg).encode("utf-8")
    sys.stdout.buffer.write(struct.pack(">I", len(payload)))
    sys.stdout.buffer.write(payload)
    sys.stdout.buffer.flush()

def recv():
    raw = sys.stdin.buffer.read(4)
    if len(raw) < 4:
        sys.exit(0)
    n = struct.unpack(">I", raw)[0]
    return json.loads(sys.stdin.buffer.read(n))

msg = recv()
send({"jsonrpc": "2.0", "id": msg["id"], "result": {"ready": True}})
msg = recv()
send({"jsonrpc": "2.0", "method": "complete", "params": {"request_id": msg["id"], "success": True, "data": {}, "keep_session": False}})
"#;
        std::fs::write(&script_path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
        }

        // Point the manifest's `executable` at the python script, not
        // `plugin.sh` (`write_manifest` always names that).
        let manifest_path = dir.join("manifest.json");
        let mut manifest: Value = serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        manifest["executable"] = Value::String("plugin.py".to_string());
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
    }

    #[test]
    fn resolve_executable_joins_relative_paths_under_the_plugin_dir() {
        let dir = Path::new("/plugins/weather");
        let resolved = resolve_executable(dir, "weather.exe");
        assert_eq!(resolved, dir.join("weather.exe"));
    }

    #[test]
    fn resolve_executable_keeps_absolute_paths_untouched() {
        let dir = Path::new("/plugins/weather");
        let resolved = resolve_executable(dir, "/usr/local/bin/weather");
        assert_eq!(resolved, Path::new("/usr/local/bin/weather"));
    }

    #[test]
    fn discover_skips_directories_without_a_manifest() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("weather")).unwrap();
        write_manifest(&root.path().join("weather"), "weather", true);
        std::fs::create_dir(root.path().join("not_a_plugin")).unwrap();

        let descriptors = discover(root.path()).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].manifest.name, "weather");
    }

    #[test]
    fn discover_skips_invalid_manifests_without_failing_the_whole_scan() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("weather")).unwrap();
        write_manifest(&root.path().join("weather"), "weather", true);
        std::fs::create_dir(root.path().join("broken")).unwrap();
        std::fs::write(root.path().join("broken/manifest.json"), "{ not json").unwrap();

        let descriptors = discover(root.path()).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].manifest.name, "weather");
    }

    #[tokio::test]
    async fn dispatch_turn_rejects_unknown_function_with_no_owned_session() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let err = engine.dispatch_turn(Some("no_such_fn"), Value::Null, "hi").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownFunction(name) if name == "no_such_fn"));
    }

    #[tokio::test]
    async fn dispatch_turn_with_no_function_and_no_owner_is_rejected() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let err = engine.dispatch_turn(None, Value::Null, "hi").await.unwrap_err();
        assert!(matches!(err, EngineError::MissingFunction));
    }

    #[tokio::test]
    async fn plugin_termination_releases_session_ownership() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        engine.session.on_complete("chatty", true).await;
        assert_eq!(engine.session.current_owner().await.as_deref(), Some("chatty"));

        engine
            .bus
            .publish(&PLUGIN_TERMINATED, serde_json::json!({"plugin": "chatty"}))
            .await;
        // Let the background listener task run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(engine.session.current_owner().await.is_none());
    }

    #[tokio::test]
    async fn lazy_plugin_is_spawned_on_its_first_dispatch_and_respawned_after_termination() {
        let root = tempfile::tempdir().unwrap();
        let plugin_dir = root.path().join("greeter");
        std::fs::create_dir(&plugin_dir).unwrap();
        write_lazy_plugin(&plugin_dir, "greeter");

        let mut config = EngineConfig::default();
        config.plugins_dir = root.path().to_path_buf();
        let engine = Engine::new(config).unwrap();
        let report = engine.discover_and_start().await.unwrap();
        assert!(report.started.is_empty(), "a non-persistent plugin must not be started eagerly");
        assert!(engine.instances.read().await.get("greeter").is_none());

        let dispatch = engine.dispatch_turn(Some("greeter_fn"), Value::Null, "hi").await.unwrap();
        let outcome = dispatch.handle.result.await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Complete { success: true, .. }));
        assert!(engine.instances.read().await.get("greeter").is_some(), "the first dispatch must spawn the plugin");

        // The fake plugin exits right after its one scripted `complete`; give
        // its reader task a moment to observe EOF and mark it Terminated.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let instance = engine.instances.read().await.get("greeter").cloned().unwrap();
        assert_eq!(instance.state().await, InstanceState::Terminated);

        let dispatch = engine.dispatch_turn(Some("greeter_fn"), Value::Null, "hi again").await.unwrap();
        let outcome = dispatch.handle.result.await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Complete { success: true, .. }), "a terminated plugin must respawn on its next dispatch");

        let respawned = engine.instances.read().await.get("greeter").cloned().unwrap();
        assert_ne!(Arc::as_ptr(&instance), Arc::as_ptr(&respawned), "respawn must be a fresh instance, not the terminated one");
    }
}
