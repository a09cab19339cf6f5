//! Command registration: the map from a manifest function name to the
//! handler that executes it, plus the single special `on_input` handler
//! consulted while a plugin owns the passthrough session (spec §4.D/§4.H).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ctx::PluginCtx;
use crate::stream::StreamEmitter;
use crate::PluginSdkError;

/// One plugin-declared function. Implementors receive the plugin's own
/// [`PluginCtx`] (its working/config directory), the call's `params`, and an
/// emitter for intermediate streaming output; the return value becomes the
/// `data` field of the terminal `complete` notification.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, ctx: &PluginCtx, params: Value, stream: StreamEmitter) -> Result<Value, PluginSdkError>;
}

/// Adapts a plain async closure into a [`CommandHandler`] so simple plugins
/// don't need to name a struct for every function.
pub struct FnCommand<F>(pub F);

#[async_trait]
impl<F, Fut> CommandHandler for FnCommand<F>
where
    F: Fn(PluginCtx, Value, StreamEmitter) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, PluginSdkError>> + Send,
{
    async fn call(&self, ctx: &PluginCtx, params: Value, stream: StreamEmitter) -> Result<Value, PluginSdkError> {
        (self.0)(ctx.clone(), params, stream).await
    }
}

struct Entry {
    handler: Arc<dyn CommandHandler>,
    description: String,
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Entry>,
    on_input: Option<Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.register_described(name, "", handler);
    }

    pub fn register_described(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) {
        self.commands.insert(
            name.into(),
            Entry {
                handler: Arc::new(handler),
                description: description.into(),
            },
        );
    }

    /// Register the handler invoked for every `input` method call while
    /// this plugin owns the passthrough session (spec §4.D step 2,
    /// `input` branch). Absent a registration the run loop echoes the
    /// turn's content back as-is.
    pub fn set_on_input(&mut self, handler: impl CommandHandler + 'static) {
        self.on_input = Some(Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands.get(name).map(|e| Arc::clone(&e.handler))
    }

    pub fn on_input(&self) -> Option<Arc<dyn CommandHandler>> {
        self.on_input.clone()
    }

    /// `{name, description}` pairs for the `initialize` response's
    /// `commands` field (spec §6).
    pub fn descriptors(&self) -> Vec<serde_json::Value> {
        self.commands
            .iter()
            .map(|(name, entry)| {
                serde_json::json!({"name": name, "description": entry.description})
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }
}
