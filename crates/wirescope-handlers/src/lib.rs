//! Stream handler implementations
//!
//! - **net**: packet and byte counters, top talkers
//! - **dns**: query/reply/rcode counters, top query names, qname and rcode filters
//!
//! [`register`] adds every handler factory to a plugin registry.

use std::sync::Arc;
use wirescope_core::PluginRegistry;

pub mod dns;
pub mod net;
pub mod windowed;

#[cfg(test)]
mod policy_tests;

pub use dns::{DnsHandlerFactory, DnsStreamHandler};
pub use net::{NetHandlerFactory, NetStreamHandler};
pub use windowed::{PacketProcessor, WindowedHandler};

/// Register every handler type provided by this crate
pub fn register(plugins: &mut PluginRegistry) {
    plugins.register_handler(Arc::new(NetHandlerFactory));
    plugins.register_handler(Arc::new(DnsHandlerFactory));
}
