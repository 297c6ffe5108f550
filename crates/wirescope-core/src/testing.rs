//! Minimal input and handler plugins for exercising the registries

use crate::configurable::ModuleConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{event_bus, EventSender};
use crate::handler::StreamHandler;
use crate::input::{InputStream, ManagedInputStream};
use crate::module::Module;
use crate::plugins::{
    check_upstream, HandlerFactory, InputAttachment, InputFactory, PluginRegistry,
    UpstreamHandler,
};
use crate::store::ModuleHandle;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Input that produces nothing and counts its starts
pub struct NullInput {
    name: String,
    config: ModuleConfig,
    events: EventSender,
    running: bool,
    starts: u64,
}

impl NullInput {
    /// How many times the stream behind `handle` has been started
    pub async fn starts(handle: &ModuleHandle<ManagedInputStream>) -> u64 {
        handle.lock().await.info_json()["starts"]
            .as_u64()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Module for NullInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema_key(&self) -> &str {
        "null"
    }

    fn running(&self) -> bool {
        self.running
    }

    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    async fn start(&mut self) -> CoreResult<()> {
        if self.config.get_bool("fail_start").unwrap_or(false) {
            return Err(CoreError::RuntimeStartFailure(
                "null input failed to start".to_string(),
            ));
        }
        self.running = true;
        self.starts += 1;
        Ok(())
    }

    async fn stop(&mut self) -> CoreResult<()> {
        self.running = false;
        Ok(())
    }

    fn info_json(&self) -> Value {
        json!({"name": self.name, "running": self.running, "starts": self.starts})
    }
}

impl InputStream for NullInput {
    fn events(&self) -> EventSender {
        self.events.clone()
    }
}

struct NullInputFactory;

impl InputFactory for NullInputFactory {
    fn input_type(&self) -> &str {
        "null"
    }

    fn instantiate(&self, name: &str, config: &ModuleConfig) -> CoreResult<Box<dyn InputStream>> {
        Ok(Box::new(NullInput {
            name: name.to_string(),
            config: config.clone(),
            events: event_bus(),
            running: false,
            starts: 0,
        }))
    }
}

/// Handler that records its wiring and does nothing else
pub struct NullHandler {
    name: String,
    handler_type: &'static str,
    config: ModuleConfig,
    upstream: Option<String>,
    output: EventSender,
    running: bool,
}

#[async_trait]
impl Module for NullHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema_key(&self) -> &str {
        self.handler_type
    }

    fn running(&self) -> bool {
        self.running
    }

    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    async fn start(&mut self) -> CoreResult<()> {
        if self.config.get_bool("fail_start").unwrap_or(false) {
            return Err(CoreError::RuntimeStartFailure(
                "null handler failed to start".to_string(),
            ));
        }
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> CoreResult<()> {
        self.running = false;
        Ok(())
    }
}

impl StreamHandler for NullHandler {
    fn output(&self) -> EventSender {
        self.output.clone()
    }

    fn upstream(&self) -> Option<&str> {
        self.upstream.as_deref()
    }

    fn window_json(&self, bucket: usize) -> CoreResult<Value> {
        if bucket > 0 {
            return Err(CoreError::NotFound(format!("bucket {} does not exist", bucket)));
        }
        Ok(json!({}))
    }
}

/// `null` accepts a `null` upstream; `picky` accepts none
struct NullHandlerFactory {
    handler_type: &'static str,
    label: &'static str,
    accepts: &'static [&'static str],
}

impl HandlerFactory for NullHandlerFactory {
    fn handler_type(&self) -> &str {
        self.handler_type
    }

    fn instantiate(
        &self,
        name: &str,
        _input: &InputAttachment,
        config: &ModuleConfig,
        upstream: Option<&UpstreamHandler>,
    ) -> CoreResult<Box<dyn StreamHandler>> {
        check_upstream(self.label, self.accepts, upstream)?;
        Ok(Box::new(NullHandler {
            name: name.to_string(),
            handler_type: self.handler_type,
            config: config.clone(),
            upstream: upstream.map(|u| u.name.clone()),
            output: event_bus(),
            running: false,
        }))
    }
}

pub fn test_plugins() -> Arc<PluginRegistry> {
    Arc::new(plugin_registry())
}

pub fn plugin_registry() -> PluginRegistry {
    let mut plugins = PluginRegistry::new();
    plugins.register_input(Arc::new(NullInputFactory));
    plugins.register_handler(Arc::new(NullHandlerFactory {
        handler_type: "null",
        label: "NullHandler",
        accepts: &["null"],
    }));
    plugins.register_handler(Arc::new(NullHandlerFactory {
        handler_type: "picky",
        label: "PickyHandler",
        accepts: &[],
    }));
    plugins
}
