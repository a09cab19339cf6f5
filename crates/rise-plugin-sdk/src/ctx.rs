//! Per-plugin-process context: where a plugin lives on disk, handed to
//! every command handler so it has *some* way to find its own config/token/
//! log paths (spec.md §6 names those paths but not how a handler learns its
//! own directory at runtime).

use std::env;
use std::path::PathBuf;

/// Environment variable the host sets before spawning a plugin so it can
/// locate its own manifest/config directory without depending on `argv[0]`
/// surviving exec on every platform the host supports.
pub const PLUGIN_DIR_ENV: &str = "RISE_PLUGIN_DIR";

/// Resolve the plugin's own directory: prefer [`PLUGIN_DIR_ENV`] (set by the
/// Process Supervisor at spawn time), falling back to the directory
/// containing `argv[0]` when the variable is absent (e.g. a plugin launched
/// by hand for local testing).
pub fn plugin_dir() -> PathBuf {
    if let Ok(dir) = env::var(PLUGIN_DIR_ENV) {
        return PathBuf::from(dir);
    }
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Shared handle given to every command invocation: where the plugin lives
/// on disk. Cheap to construct and clone (one `PathBuf`), so `PluginApp::run`
/// builds one and hands a clone to every dispatched call rather than
/// resolving `plugin_dir()` over and over.
#[derive(Debug, Clone)]
pub struct PluginCtx {
    pub plugin_dir: PathBuf,
}

impl PluginCtx {
    pub fn new() -> Self {
        Self { plugin_dir: plugin_dir() }
    }

    pub fn config_path(&self, file_name: &str) -> PathBuf {
        self.plugin_dir.join(file_name)
    }
}

impl Default for PluginCtx {
    fn default() -> Self {
        Self::new()
    }
}
