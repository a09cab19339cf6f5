//! Engine-level timeouts and paths (spec §4.F–§4.J default values), with
//! per-plugin overrides read from that plugin's own `tether_config`.

use std::path::PathBuf;
use std::time::Duration;

use rise_protocol::manifest::TetherConfig;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub plugins_dir: PathBuf,
    /// Bounded wait for a plugin's response to the `initialize` request.
    pub t_init: Duration,
    /// Graceful shutdown wait after the `shutdown` notification (§4.F).
    pub t_graceful: Duration,
    /// Forced-kill wait after a graceful shutdown attempt expires (§4.F).
    pub t_force: Duration,
    /// Soft deadline for one `execute` call (§5).
    pub t_exec: Duration,
    /// Overall passthrough-session deadline since last activity (§4.H).
    pub t_session: Duration,
    /// Watchdog ping tick period (§4.I).
    pub t_ping: Duration,
    /// Watchdog pong deadline (§4.I).
    pub t_pong: Duration,
    /// `input` ack deadline (§5).
    pub t_ack: Duration,
    /// Grace period given to `mcp.launch_on_startup` plugins before the
    /// engine re-reads their manifest (§4.G step 3).
    pub mcp_launch_grace: Duration,
    /// Manifest Watcher debounce (§4.J).
    pub manifest_debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            t_init: Duration::from_secs(5),
            t_graceful: Duration::from_secs(2),
            t_force: Duration::from_secs(2),
            t_exec: Duration::from_secs(30),
            t_session: Duration::from_secs(300),
            t_ping: Duration::from_secs(5),
            t_pong: Duration::from_secs(1),
            t_ack: Duration::from_secs(2),
            mcp_launch_grace: Duration::from_secs(5),
            manifest_debounce: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    pub fn ping_interval_for(&self, tether: Option<&TetherConfig>) -> Duration {
        tether
            .and_then(|t| t.heartbeat_interval)
            .map(Duration::from_secs)
            .unwrap_or(self.t_ping)
    }

    /// `heartbeat_timeout`, if the manifest declares one, is an absolute
    /// cap on time-since-last-successful-pong independent of the
    /// missed-pong counter.
    pub fn heartbeat_timeout_for(&self, tether: Option<&TetherConfig>) -> Option<Duration> {
        tether.and_then(|t| t.heartbeat_timeout).map(Duration::from_secs)
    }

    pub fn init_timeout_for(&self, tether: Option<&TetherConfig>) -> Duration {
        tether
            .and_then(|t| t.onboarding_timeout)
            .map(Duration::from_secs)
            .unwrap_or(self.t_init)
    }

    pub fn passthrough_allowed_for(&self, tether: Option<&TetherConfig>) -> bool {
        tether.and_then(|t| t.allow_passthrough).unwrap_or(true)
    }
}
