//! Plugin factories
//!
//! Input stream and stream handler types are provided by plugin crates.
//! Each crate exposes a `register` function that adds its factories to a
//! [`PluginRegistry`] once at startup; the core only ever looks factories
//! up by type name.

use crate::configurable::ModuleConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::EventSender;
use crate::handler::StreamHandler;
use crate::input::InputStream;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Creates input streams of one type
pub trait InputFactory: Send + Sync {
    /// Input type name, as used in `input_type` configuration keys
    fn input_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Create a stopped input stream with its effective configuration
    fn instantiate(&self, name: &str, config: &ModuleConfig) -> CoreResult<Box<dyn InputStream>>;
}

/// The input stream a handler is being attached to
#[derive(Debug, Clone)]
pub struct InputAttachment {
    pub name: String,
    pub input_type: String,
    pub events: EventSender,
}

/// The handler a new handler is chained behind
#[derive(Debug, Clone)]
pub struct UpstreamHandler {
    pub name: String,
    pub handler_type: String,
    pub output: EventSender,
}

/// Creates stream handlers of one type
pub trait HandlerFactory: Send + Sync {
    /// Handler type name, as used in `type` configuration keys
    fn handler_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Create a stopped handler.
    ///
    /// `upstream` is set when the handler is chained behind another one;
    /// the factory must reject upstream types it cannot consume.
    fn instantiate(
        &self,
        name: &str,
        input: &InputAttachment,
        config: &ModuleConfig,
        upstream: Option<&UpstreamHandler>,
    ) -> CoreResult<Box<dyn StreamHandler>>;
}

/// Accept `upstream` only if its type is in `accepted`.
///
/// `label` names the handler implementation in the error message.
pub fn check_upstream(
    label: &str,
    accepted: &[&str],
    upstream: Option<&UpstreamHandler>,
) -> CoreResult<()> {
    match upstream {
        Some(up) if !accepted.contains(&up.handler_type.as_str()) => {
            Err(CoreError::ChainIncompatible(format!(
                "{}: unsupported upstream chained stream handler {}",
                label, up.name
            )))
        }
        _ => Ok(()),
    }
}

/// Registry of all available plugin factories
#[derive(Default)]
pub struct PluginRegistry {
    inputs: BTreeMap<String, Arc<dyn InputFactory>>,
    handlers: BTreeMap<String, Arc<dyn HandlerFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_input(&mut self, factory: Arc<dyn InputFactory>) {
        let input_type = factory.input_type().to_string();
        if self.inputs.insert(input_type.clone(), factory).is_some() {
            warn!(input_type = %input_type, "Input factory registered twice, keeping the last one");
        }
    }

    pub fn register_handler(&mut self, factory: Arc<dyn HandlerFactory>) {
        let handler_type = factory.handler_type().to_string();
        if self.handlers.insert(handler_type.clone(), factory).is_some() {
            warn!(handler_type = %handler_type, "Handler factory registered twice, keeping the last one");
        }
    }

    pub fn input(&self, input_type: &str) -> Option<Arc<dyn InputFactory>> {
        self.inputs.get(input_type).cloned()
    }

    pub fn handler(&self, handler_type: &str) -> Option<Arc<dyn HandlerFactory>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn input_types(&self) -> Vec<String> {
        self.inputs.keys().cloned().collect()
    }

    pub fn handler_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// (type, description) pairs for every registered input factory
    pub fn describe_inputs(&self) -> Vec<(String, String)> {
        self.inputs
            .iter()
            .map(|(k, f)| (k.clone(), f.description().to_string()))
            .collect()
    }

    /// (type, description) pairs for every registered handler factory
    pub fn describe_handlers(&self) -> Vec<(String, String)> {
        self.handlers
            .iter()
            .map(|(k, f)| (k.clone(), f.description().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_bus;

    #[test]
    fn test_check_upstream() {
        let up = UpstreamHandler {
            name: "default_view-default_net".to_string(),
            handler_type: "net".to_string(),
            output: event_bus(),
        };
        assert!(check_upstream("NetStreamHandler", &["net", "dns"], Some(&up)).is_ok());
        assert!(check_upstream("DnsStreamHandler", &[], None).is_ok());

        let err = check_upstream("DnsStreamHandler", &[], Some(&up)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "DnsStreamHandler: unsupported upstream chained stream handler default_view-default_net"
        );
    }
}
