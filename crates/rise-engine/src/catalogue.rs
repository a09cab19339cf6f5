//! The engine's copy-on-write function catalogue (spec §4.G step 4, §5
//! "Shared resources and locking"): a snapshot mapping a function name to
//! the plugin that serves it, published fresh on discovery and on every
//! manifest reload.
//!
//! Shaped the same way `PluginLoader::clients()` hands out a cloned
//! `Vec<Arc<PluginSubprocess>>` rather than holding a lock across use:
//! readers clone the `Arc<Catalogue>` under the `RwLock` and release it
//! immediately, so a reload never blocks an in-flight dispatch resolution.

use std::collections::HashMap;
use std::sync::Arc;

use rise_protocol::manifest::FunctionDecl;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct CatalogueEntry {
    pub plugin: String,
    pub function: FunctionDecl,
}

#[derive(Debug, Clone, Default)]
pub struct Catalogue {
    routes: HashMap<String, CatalogueEntry>,
}

impl Catalogue {
    pub fn resolve(&self, function_name: &str) -> Option<&CatalogueEntry> {
        self.routes.get(function_name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &CatalogueEntry> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A builder used while assembling or rebuilding a snapshot; kept separate
/// from [`Catalogue`] itself so the published type stays read-only.
#[derive(Default)]
pub struct CatalogueBuilder {
    routes: HashMap<String, CatalogueEntry>,
}

impl CatalogueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or overwrite, last writer wins) every function a plugin
    /// declares. Called once per plugin during discovery/reload; within a
    /// single manifest, duplicate function names are already rejected by
    /// `Manifest::validate`.
    pub fn add_plugin(&mut self, plugin: &str, functions: &[FunctionDecl]) {
        for function in functions {
            self.routes.insert(
                function.name.clone(),
                CatalogueEntry {
                    plugin: plugin.to_string(),
                    function: function.clone(),
                },
            );
        }
    }

    /// Drop every route previously contributed by `plugin`, ahead of
    /// re-adding its current functions — used when reloading a single
    /// plugin's manifest without rebuilding the whole catalogue from
    /// scratch.
    pub fn remove_plugin(&mut self, plugin: &str) {
        self.routes.retain(|_, entry| entry.plugin != plugin);
    }

    pub fn build(self) -> Catalogue {
        Catalogue { routes: self.routes }
    }
}

/// Shared, swappable catalogue handle. `read()` clones the inner `Arc` and
/// releases the lock before the caller does any resolution work; `publish`
/// swaps in an entirely new snapshot.
pub struct CatalogueHandle {
    inner: RwLock<Arc<Catalogue>>,
}

impl CatalogueHandle {
    pub fn new(initial: Catalogue) -> Self {
        Self { inner: RwLock::new(Arc::new(initial)) }
    }

    pub async fn snapshot(&self) -> Arc<Catalogue> {
        Arc::clone(&*self.inner.read().await)
    }

    pub async fn publish(&self, catalogue: Catalogue) {
        *self.inner.write().await = Arc::new(catalogue);
    }
}

impl Default for CatalogueHandle {
    fn default() -> Self {
        Self::new(Catalogue::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str) -> FunctionDecl {
        FunctionDecl {
            name: name.to_string(),
            description: String::new(),
            tags: vec![],
            properties: Default::default(),
            required: vec![],
        }
    }

    #[test]
    fn resolves_a_function_to_its_plugin() {
        let mut builder = CatalogueBuilder::new();
        builder.add_plugin("weather", &[function("get_forecast")]);
        let catalogue = builder.build();

        let entry = catalogue.resolve("get_forecast").unwrap();
        assert_eq!(entry.plugin, "weather");
    }

    #[test]
    fn remove_plugin_drops_only_its_routes() {
        let mut builder = CatalogueBuilder::new();
        builder.add_plugin("weather", &[function("get_forecast")]);
        builder.add_plugin("clock", &[function("get_time")]);
        builder.remove_plugin("weather");
        let catalogue = builder.build();

        assert!(catalogue.resolve("get_forecast").is_none());
        assert!(catalogue.resolve("get_time").is_some());
    }

    #[tokio::test]
    async fn publish_swaps_the_whole_snapshot() {
        let handle = CatalogueHandle::default();
        assert!(handle.snapshot().await.is_empty());

        let mut builder = CatalogueBuilder::new();
        builder.add_plugin("weather", &[function("get_forecast")]);
        handle.publish(builder.build()).await;

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.len(), 1);
    }
}
