//! Global registry of child processes spawned by the host, so the engine
//! (and any UI built on top of it) can list and forcibly reap plugin and
//! MCP-server subprocesses without threading a reference through every
//! layer that might need to look one up.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

static REGISTRY: Lazy<ProcessRegistry> = Lazy::new(ProcessRegistry::new);

pub fn global_registry() -> &'static ProcessRegistry {
    &REGISTRY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Plugin,
    McpServer,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub kind: ProcessKind,
    pub started_at: i64,
}

pub struct ProcessRegistry {
    processes: RwLock<HashMap<u32, ProcessInfo>>,
}

impl ProcessRegistry {
    fn new() -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, pid: u32, name: String, kind: ProcessKind) {
        let info = ProcessInfo {
            pid,
            name,
            kind,
            started_at: chrono::Utc::now().timestamp(),
        };
        self.processes.write().insert(pid, info);
    }

    pub fn unregister(&self, pid: u32) {
        self.processes.write().remove(&pid);
    }

    pub fn list(&self) -> Vec<ProcessInfo> {
        self.processes.read().values().cloned().collect()
    }

    pub fn get(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes.read().get(&pid).cloned()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_list_roundtrip() {
        let reg = ProcessRegistry::new();
        reg.register(1234, "weather".into(), ProcessKind::Plugin);
        assert_eq!(reg.list().len(), 1);
        assert!(reg.get(1234).is_some());
        reg.unregister(1234);
        assert!(reg.get(1234).is_none());
    }
}
