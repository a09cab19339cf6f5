//! A small internal publish/subscribe bus used to fan engine-side events
//! (plugin state transitions, watchdog kills, manifest reloads) out to
//! whatever is hosting the engine (a TUI, an HTTP layer, tests) without
//! coupling the engine to any one consumer.
//!
//! This is deliberately not the request/response path — `stream`,
//! `complete`, and `error` notifications for a specific in-flight request
//! are routed directly to their caller by the dispatch handle (§4.G), not
//! broadcast here. The bus carries coarser lifecycle events.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BusEvent {
    pub event_type: String,
    pub properties: serde_json::Value,
}

pub struct BusEventDef {
    pub event_type: &'static str,
}

impl BusEventDef {
    pub const fn new(event_type: &'static str) -> Self {
        Self { event_type }
    }
}

type BoxedCallback = Box<dyn Fn(&str, serde_json::Value) + Send + Sync>;

struct Subscription {
    id: u64,
    callback: BoxedCallback,
}

/// Event bus. Cheap to `Arc` and share; `publish` never blocks on a
/// downstream consumer that isn't keeping up with its channel (the
/// broadcast channel just drops for slow readers, callbacks run inline).
pub struct Bus {
    next_id: Arc<RwLock<u64>>,
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscription>>>>,
    tx: broadcast::Sender<BusEvent>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            next_id: Arc::new(RwLock::new(0)),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            tx,
        }
    }

    pub async fn publish(&self, def: &BusEventDef, properties: serde_json::Value) {
        tracing::debug!(event_type = def.event_type, "publishing bus event");

        let event = BusEvent {
            event_type: def.event_type.to_string(),
            properties: properties.clone(),
        };
        let _ = self.tx.send(event);

        let subscribers = self.subscribers.read().await;
        if let Some(subs) = subscribers.get(def.event_type) {
            for sub in subs {
                (sub.callback)(def.event_type, properties.clone());
            }
        }
    }

    pub async fn subscribe<F>(&self, def: &BusEventDef, callback: F) -> u64
    where
        F: Fn(&str, serde_json::Value) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_id.write().await;
            *next += 1;
            *next
        };
        let mut subscribers = self.subscribers.write().await;
        subscribers
            .entry(def.event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Subscription {
                id,
                callback: Box::new(callback),
            });
        id
    }

    pub async fn unsubscribe(&self, event_type: &str, id: u64) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(event_type) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Subscribe via a broadcast channel instead of a callback — useful for
    /// an async consumer (the host binary's shutdown-signal loop, tests).
    pub fn subscribe_channel(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

pub const fn define_event(event_type: &'static str) -> BusEventDef {
    BusEventDef::new(event_type)
}

/// Well-known engine lifecycle events published on the bus.
pub static PLUGIN_STARTED: BusEventDef = BusEventDef::new("plugin.started");
pub static PLUGIN_TERMINATED: BusEventDef = BusEventDef::new("plugin.terminated");
pub static PLUGIN_WATCHDOG_KILLED: BusEventDef = BusEventDef::new("plugin.watchdog_killed");
pub static MANIFEST_RELOADED: BusEventDef = BusEventDef::new("manifest.reloaded");
pub static SESSION_OWNER_CHANGED: BusEventDef = BusEventDef::new("session.owner_changed");

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        bus.subscribe(&PLUGIN_STARTED, move |_, _| {
            counter2.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        bus.publish(&PLUGIN_STARTED, serde_json::json!({"plugin": "weather"}))
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Bus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        let id = bus
            .subscribe(&PLUGIN_STARTED, move |_, _| {
                counter2.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        bus.unsubscribe(PLUGIN_STARTED.event_type, id).await;
        bus.publish(&PLUGIN_STARTED, serde_json::json!({})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn channel_subscribers_see_events_too() {
        let bus = Bus::new();
        let mut rx = bus.subscribe_channel();
        bus.publish(&MANIFEST_RELOADED, serde_json::json!({"plugin": "x"}))
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "manifest.reloaded");
    }
}
