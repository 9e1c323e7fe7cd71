//! Process-facing services around the recall engine: configuration, plugin
//! search paths and discovery, the port monitor, and the [`Engine`] that ties
//! them to the audio loop.

pub mod config;
pub mod engine;
pub mod monitor;
pub mod paths;
pub mod registry;

pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError, RunningEngine};
pub use monitor::{port_monitor, PortMonitor, PortPublisher, PortReading, PortSnapshot};
pub use registry::{DiscoveredPlugin, NativePluginRegistry};
