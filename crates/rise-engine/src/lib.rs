//! Engine Core (spec §4.G): plugin discovery, startup, dispatch routing via
//! the Passthrough/Session Controller (§4.H), the copy-on-write function
//! catalogue, and the per-plugin Watchdog (§4.I), all wired against the
//! Process Supervisor and Manifest Watcher.

pub mod catalogue;
pub mod config;
pub mod engine;
pub mod instance;
pub mod session;
pub mod watchdog;

pub use catalogue::{Catalogue, CatalogueBuilder, CatalogueEntry, CatalogueHandle};
pub use config::EngineConfig;
pub use engine::{Dispatch, Engine, EngineError, PluginDescriptor, StartupReport};
pub use instance::{DispatchHandle, DispatchOutcome, InstanceError, InstanceState, PluginInstance};
pub use session::{Route, SessionController, SessionState};
pub use watchdog::MissCounter;
