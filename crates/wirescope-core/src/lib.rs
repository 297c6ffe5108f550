//! Wirescope Core - module registries and policy orchestration
//!
//! This crate turns a declarative configuration into a running graph of
//! capture sources and chained processing modules:
//!
//! - **Store**: named, individually locked module storage
//! - **Taps**: named capture-source templates
//! - **Inputs**: live capture sources, shared by fingerprint
//! - **Handlers**: processing modules, optionally chained
//! - **Policies**: transactional assembly and teardown of the above
//! - **Plugins**: factories for input and handler types

pub mod config;
pub mod configurable;
pub mod error;
pub mod events;
pub mod handler;
pub mod input;
pub mod module;
pub mod plugins;
pub mod policy;
pub mod prometheus;
pub mod registry;
pub mod store;
pub mod tap;
pub mod window;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{ConfigError, ConfigLoader, SensorSettings, WirescopeConfig};
pub use configurable::ModuleConfig;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use events::{event_bus, Direction, DnsSummary, EventReceiver, EventSender, PacketEvent, Protocol};
pub use handler::{HandlerManager, StreamHandler};
pub use input::{InputRef, InputStream, InputStreamManager};
pub use module::{BackgroundTask, Module};
pub use plugins::{HandlerFactory, InputAttachment, InputFactory, PluginRegistry, UpstreamHandler};
pub use policy::{Policy, PolicyKind, PolicyManager};
pub use prometheus::{MetricKind, PrometheusText};
pub use registry::{ConfigureError, CoreRegistry, LoadSummary};
pub use store::{ModuleGuard, ModuleHandle, ModuleStore};
pub use tap::{Tap, TapManager};
pub use window::{MetricsBucket, WindowConfig, WindowedMetrics};

/// Wirescope version
pub const WIRESCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");
