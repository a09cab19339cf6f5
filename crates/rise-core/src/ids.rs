//! ID generation shared across the engine and the plugin SDK.
//!
//! Two distinct kinds of identifier are needed: monotonic per-direction
//! JSON-RPC request ids (plain `u64` counters, §3 "request id is a
//! non-negative integer, unique per direction until matched"), and
//! human-correlatable string ids for longer-lived objects (plugin
//! instances, MCP sessions) used only in logs and diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates monotonically increasing JSON-RPC request ids for one
/// direction of a connection (engine→plugin or plugin→MCP-server).
///
/// A fresh allocator must be created per direction; sharing one across two
/// directions would violate the "unique per direction" invariant trivially
/// but correlate differently-owned requests under the same id space, which
/// the pending-request tables assume never happens.
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    next: AtomicU64,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Plugin,
    McpSession,
    WatchEvent,
}

impl Prefix {
    fn as_str(self) -> &'static str {
        match self {
            Prefix::Plugin => "plg",
            Prefix::McpSession => "mcs",
            Prefix::WatchEvent => "wch",
        }
    }
}

/// Generate a correlatable id: `<prefix>_<millis-hex><random base62 suffix>`.
///
/// Not cryptographically significant — used purely so log lines and the
/// (future) TUI can group events belonging to the same instance.
pub fn create(prefix: Prefix) -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut rng = rand::thread_rng();
    use rand::Rng;
    let suffix: String = (0..12)
        .map(|_| BASE62_CHARS[rng.gen_range(0..62)] as char)
        .collect();
    format!("{}_{:012x}{}", prefix.as_str(), millis, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_increasing() {
        let alloc = RequestIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert!(b > a);
    }

    #[test]
    fn created_ids_carry_their_prefix() {
        let id = create(Prefix::Plugin);
        assert!(id.starts_with("plg_"));
    }
}
