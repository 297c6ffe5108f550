//! Input stream implementations
//!
//! Each input type is exposed as an [`InputFactory`](wirescope_core::InputFactory);
//! [`register`] adds all of them to a plugin registry.

use std::sync::Arc;
use wirescope_core::PluginRegistry;

pub mod filter;
pub mod mock;

pub use filter::PacketFilter;
pub use mock::{MockInputFactory, MockInputStream};

/// Register every input type provided by this crate
pub fn register(plugins: &mut PluginRegistry) {
    plugins.register_input(Arc::new(MockInputFactory));
}
