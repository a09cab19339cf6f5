//! Layered engine configuration: defaults, overridden by an optional TOML
//! file, overridden by environment variables, overridden by CLI flags —
//! the same source-precedence order the teacher's `rocode-config` uses for
//! its config merge, minus the network-fetched wellknown layer (no remote
//! config source exists here).

use std::path::PathBuf;
use std::time::Duration;

use rise_engine::EngineConfig;
use serde::Deserialize;

/// On-disk shape of `rise.toml`. Every field is optional; an absent field
/// falls through to [`EngineConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfigFile {
    pub plugins_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub t_init_secs: Option<u64>,
    pub t_graceful_secs: Option<u64>,
    pub t_force_secs: Option<u64>,
    pub t_exec_secs: Option<u64>,
    pub t_session_secs: Option<u64>,
    pub t_ping_secs: Option<u64>,
    pub t_pong_secs: Option<u64>,
    pub t_ack_secs: Option<u64>,
    pub mcp_launch_grace_secs: Option<u64>,
    pub manifest_debounce_ms: Option<u64>,
}

impl HostConfigFile {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        let parsed: Self = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
        Ok(parsed)
    }

    /// Load `path` if it exists, else fall back to an all-default config —
    /// a missing config file is not an error, it just means "use defaults".
    pub fn load_or_default(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Environment variable overrides, applied after the file layer and before
/// CLI flags. Names mirror the file's field names upper-cased under the
/// `RISE_` prefix.
fn env_override(file: &mut HostConfigFile) {
    if let Ok(v) = std::env::var("RISE_PLUGINS_DIR") {
        file.plugins_dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("RISE_LOG_LEVEL") {
        file.log_level = Some(v);
    }
    macro_rules! secs_override {
        ($env:literal, $field:ident) => {
            if let Ok(v) = std::env::var($env) {
                if let Ok(n) = v.parse::<u64>() {
                    file.$field = Some(n);
                }
            }
        };
    }
    secs_override!("RISE_T_INIT_SECS", t_init_secs);
    secs_override!("RISE_T_GRACEFUL_SECS", t_graceful_secs);
    secs_override!("RISE_T_FORCE_SECS", t_force_secs);
    secs_override!("RISE_T_EXEC_SECS", t_exec_secs);
    secs_override!("RISE_T_SESSION_SECS", t_session_secs);
    secs_override!("RISE_T_PING_SECS", t_ping_secs);
    secs_override!("RISE_T_PONG_SECS", t_pong_secs);
    secs_override!("RISE_T_ACK_SECS", t_ack_secs);
    secs_override!("RISE_MCP_LAUNCH_GRACE_SECS", mcp_launch_grace_secs);
    secs_override!("RISE_MANIFEST_DEBOUNCE_MS", manifest_debounce_ms);
}

/// Build the final [`EngineConfig`] from file + environment + an optional
/// CLI-supplied plugins directory (the highest-precedence source, since an
/// explicit `--plugins-dir` flag is the most specific thing the operator
/// can say).
pub fn resolve(mut file: HostConfigFile, cli_plugins_dir: Option<PathBuf>) -> EngineConfig {
    env_override(&mut file);

    let defaults = EngineConfig::default();
    EngineConfig {
        plugins_dir: cli_plugins_dir
            .or(file.plugins_dir)
            .unwrap_or(defaults.plugins_dir),
        t_init: file.t_init_secs.map(Duration::from_secs).unwrap_or(defaults.t_init),
        t_graceful: file.t_graceful_secs.map(Duration::from_secs).unwrap_or(defaults.t_graceful),
        t_force: file.t_force_secs.map(Duration::from_secs).unwrap_or(defaults.t_force),
        t_exec: file.t_exec_secs.map(Duration::from_secs).unwrap_or(defaults.t_exec),
        t_session: file.t_session_secs.map(Duration::from_secs).unwrap_or(defaults.t_session),
        t_ping: file.t_ping_secs.map(Duration::from_secs).unwrap_or(defaults.t_ping),
        t_pong: file.t_pong_secs.map(Duration::from_secs).unwrap_or(defaults.t_pong),
        t_ack: file.t_ack_secs.map(Duration::from_secs).unwrap_or(defaults.t_ack),
        mcp_launch_grace: file
            .mcp_launch_grace_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.mcp_launch_grace),
        manifest_debounce: file
            .manifest_debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.manifest_debounce),
    }
}

pub fn log_level(file: &HostConfigFile) -> String {
    std::env::var("RISE_LOG_LEVEL")
        .ok()
        .or_else(|| file.log_level.clone())
        .unwrap_or_else(|| "info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let file = HostConfigFile::load_or_default(std::path::Path::new("/nonexistent/rise.toml")).unwrap();
        let config = resolve(file, None);
        assert_eq!(config.plugins_dir, PathBuf::from("plugins"));
        assert_eq!(config.t_ping, Duration::from_secs(5));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rise.toml");
        std::fs::write(&path, "plugins_dir = \"/opt/plugins\"\nt_ping_secs = 10\n").unwrap();

        let file = HostConfigFile::load_or_default(&path).unwrap();
        let config = resolve(file, None);
        assert_eq!(config.plugins_dir, PathBuf::from("/opt/plugins"));
        assert_eq!(config.t_ping, Duration::from_secs(10));
    }

    #[test]
    fn cli_plugins_dir_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rise.toml");
        std::fs::write(&path, "plugins_dir = \"/opt/plugins\"\n").unwrap();

        let file = HostConfigFile::load_or_default(&path).unwrap();
        let config = resolve(file, Some(PathBuf::from("/cli/plugins")));
        assert_eq!(config.plugins_dir, PathBuf::from("/cli/plugins"));
    }
}
