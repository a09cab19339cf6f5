//! Manifest Watcher (spec §4.J): watches each plugin directory's
//! `manifest.json` and, on a debounced change, re-parses it and broadcasts
//! the new (or rejected) view for the engine to fold into its catalogue.
//!
//! Grounded on `rocode-watcher::FileWatcher` — same `notify::RecommendedWatcher`
//! construction and broadcast fan-out — generalized from "watch a directory
//! tree with glob ignore patterns" down to "watch one well-known filename
//! per plugin directory" and from a fixed poll-interval debounce to an
//! explicit per-path debounce task, since a single renamed-into-place write
//! needs to collapse to one reload regardless of how the native backend
//! reports it (a create + a modify, on some platforms).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use rise_protocol::manifest::{Manifest, ManifestError};
use tokio::sync::broadcast;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("failed to create watcher: {0}")]
    Create(#[from] notify::Error),

    #[error("plugin directory does not exist: {0}")]
    PathNotFound(PathBuf),

    #[error("already watching: {0}")]
    AlreadyWatching(PathBuf),
}

#[derive(Debug, Clone)]
pub enum ManifestChange {
    /// The manifest re-parsed and validated cleanly; this is the new view
    /// to swap into the engine's catalogue.
    Updated(Box<Manifest>),
    /// The manifest changed but failed to parse or validate; the engine
    /// keeps serving the previous view and this is logged.
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct ManifestEvent {
    pub plugin_dir: PathBuf,
    pub change: ManifestChange,
}

#[derive(Debug, Clone)]
pub struct ManifestWatcherConfig {
    pub debounce: Duration,
}

impl Default for ManifestWatcherConfig {
    fn default() -> Self {
        Self { debounce: DEFAULT_DEBOUNCE }
    }
}

/// Watches `manifest.json` inside each registered plugin directory and
/// broadcasts debounced [`ManifestEvent`]s.
pub struct ManifestWatcher {
    watcher: RwLock<Option<RecommendedWatcher>>,
    watched_dirs: DashMap<PathBuf, ()>,
    generations: Arc<DashMap<PathBuf, Arc<AtomicU64>>>,
    tx: broadcast::Sender<ManifestEvent>,
    debounce: Duration,
}

impl ManifestWatcher {
    pub fn new(config: ManifestWatcherConfig) -> Result<Self, WatcherError> {
        let (tx, _) = broadcast::channel(1024);
        Ok(Self {
            watcher: RwLock::new(None),
            watched_dirs: DashMap::new(),
            generations: Arc::new(DashMap::new()),
            tx,
            debounce: config.debounce,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManifestEvent> {
        self.tx.subscribe()
    }

    /// Start watching `plugin_dir`'s `manifest.json`. Lazily creates the one
    /// underlying OS watcher shared by every watched plugin directory (each
    /// directory is registered non-recursively so sibling plugin
    /// directories don't cross-report into each other's events).
    pub fn watch_plugin_dir(&self, plugin_dir: &Path) -> Result<(), WatcherError> {
        if !plugin_dir.exists() {
            return Err(WatcherError::PathNotFound(plugin_dir.to_path_buf()));
        }
        let plugin_dir = plugin_dir.to_path_buf();
        if self.watched_dirs.contains_key(&plugin_dir) {
            return Err(WatcherError::AlreadyWatching(plugin_dir));
        }

        self.ensure_watcher()?;
        self.generations.entry(plugin_dir.clone()).or_insert_with(|| Arc::new(AtomicU64::new(0)));

        let mut guard = self.watcher.write();
        let watcher = guard.as_mut().expect("ensure_watcher just initialised it");
        watcher.watch(&plugin_dir, RecursiveMode::NonRecursive)?;
        drop(guard);

        self.watched_dirs.insert(plugin_dir, ());
        Ok(())
    }

    pub fn unwatch_plugin_dir(&self, plugin_dir: &Path) {
        self.watched_dirs.remove(plugin_dir);
        self.generations.remove(plugin_dir);
        if let Some(watcher) = self.watcher.write().as_mut() {
            let _ = watcher.unwatch(plugin_dir);
        }
    }

    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.watched_dirs.iter().map(|e| e.key().clone()).collect()
    }

    fn ensure_watcher(&self) -> Result<(), WatcherError> {
        if self.watcher.read().is_some() {
            return Ok(());
        }
        let tx = self.tx.clone();
        let generations = Arc::clone(&self.generations);
        let debounce = self.debounce;

        let watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "manifest watcher backend error");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                return;
            }
            for path in &event.paths {
                if path.file_name().and_then(|n| n.to_str()) != Some("manifest.json") {
                    continue;
                }
                let Some(plugin_dir) = path.parent().map(Path::to_path_buf) else { continue };
                schedule_reload(plugin_dir, path.clone(), Arc::clone(&generations), tx.clone(), debounce);
            }
        })?;

        *self.watcher.write() = Some(watcher);
        Ok(())
    }

    pub fn stop(&self) {
        self.watched_dirs.clear();
        self.generations.clear();
        *self.watcher.write() = None;
    }
}

impl Drop for ManifestWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Debounce one manifest path: bump its generation counter, sleep
/// `debounce`, then re-parse only if no later event bumped the counter
/// again in the meantime — collapsing a write-then-rename into one reload
/// (spec §4.J).
fn schedule_reload(
    plugin_dir: PathBuf,
    manifest_path: PathBuf,
    generations: Arc<DashMap<PathBuf, Arc<AtomicU64>>>,
    tx: broadcast::Sender<ManifestEvent>,
    debounce: Duration,
) {
    let counter = generations.entry(plugin_dir.clone()).or_insert_with(|| Arc::new(AtomicU64::new(0))).clone();
    let my_generation = counter.fetch_add(1, Ordering::SeqCst) + 1;

    tokio::spawn(async move {
        tokio::time::sleep(debounce).await;
        if counter.load(Ordering::SeqCst) != my_generation {
            return; // superseded by a later event
        }

        let change = match Manifest::load_file(&manifest_path) {
            Ok(manifest) => ManifestChange::Updated(Box::new(manifest)),
            Err(e @ ManifestError::Io { .. }) if !manifest_path.exists() => {
                ManifestChange::Invalid(format!("manifest removed: {e}"))
            }
            Err(e) => ManifestChange::Invalid(e.to_string()),
        };

        if let ManifestChange::Invalid(ref reason) = change {
            tracing::warn!(plugin_dir = %plugin_dir.display(), reason, "manifest reload rejected, keeping previous view");
        }

        let _ = tx.send(ManifestEvent { plugin_dir, change });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tokio::time::timeout;

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::write(dir.join("manifest.json"), body).unwrap();
    }

    fn minimal_manifest() -> &'static str {
        r#"{
            "manifestVersion": 1,
            "name": "weather",
            "version": "1.0.0",
            "description": "weather plugin",
            "executable": "weather.exe",
            "persistent": true,
            "protocol_version": "2.0",
            "functions": []
        }"#
    }

    #[tokio::test]
    async fn valid_change_is_broadcast_as_updated() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), minimal_manifest());

        let watcher = ManifestWatcher::new(ManifestWatcherConfig { debounce: StdDuration::from_millis(20) }).unwrap();
        let mut rx = watcher.subscribe();
        watcher.watch_plugin_dir(dir.path()).unwrap();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        write_manifest(dir.path(), &minimal_manifest().replace("1.0.0", "1.0.1"));

        let event = timeout(StdDuration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match event.change {
            ManifestChange::Updated(m) => assert_eq!(m.version, "1.0.1"),
            ManifestChange::Invalid(reason) => panic!("expected Updated, got Invalid({reason})"),
        }
    }

    #[tokio::test]
    async fn invalid_change_is_broadcast_as_invalid_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), minimal_manifest());

        let watcher = ManifestWatcher::new(ManifestWatcherConfig { debounce: StdDuration::from_millis(20) }).unwrap();
        let mut rx = watcher.subscribe();
        watcher.watch_plugin_dir(dir.path()).unwrap();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        write_manifest(dir.path(), "{ not json");

        let event = timeout(StdDuration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event.change, ManifestChange::Invalid(_)));
    }

    #[tokio::test]
    async fn rapid_successive_writes_collapse_to_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), minimal_manifest());

        let watcher = ManifestWatcher::new(ManifestWatcherConfig { debounce: StdDuration::from_millis(150) }).unwrap();
        let mut rx = watcher.subscribe();
        watcher.watch_plugin_dir(dir.path()).unwrap();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        for i in 0..5 {
            write_manifest(dir.path(), &minimal_manifest().replace("1.0.0", &format!("1.0.{i}")));
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        let event = timeout(StdDuration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match event.change {
            ManifestChange::Updated(m) => assert_eq!(m.version, "1.0.4"),
            ManifestChange::Invalid(reason) => panic!("expected Updated, got Invalid({reason})"),
        }
        assert!(timeout(StdDuration::from_millis(100), rx.recv()).await.is_err());
    }
}
