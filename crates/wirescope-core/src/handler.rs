//! Stream handler registry
//!
//! Handlers consume packet events from an input stream, or from the handler
//! before them when a policy declares its modules as a sequence, and keep
//! windowed metrics about what they saw.

use crate::configurable::ModuleConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::EventSender;
use crate::module::Module;
use crate::plugins::{InputAttachment, PluginRegistry, UpstreamHandler};
use crate::prometheus::PrometheusText;
use crate::store::ModuleStore;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A processing module attached to an input stream.
///
/// `schema_key()` is the handler type.
pub trait StreamHandler: Module {
    /// Bus carrying the events this handler passes on to chained handlers
    fn output(&self) -> EventSender;

    /// Name of the handler this one is chained behind
    fn upstream(&self) -> Option<&str>;

    /// Metrics of the `bucket`-th most recent window period, 0 being live
    fn window_json(&self, bucket: usize) -> CoreResult<Value>;

    /// Write this handler's metrics in Prometheus form
    fn prometheus(&self, _out: &mut PrometheusText, _labels: &[(&str, &str)]) {}
}

/// How a policy's modules are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainForm {
    /// Map form: every handler consumes the input stream directly
    Unordered,
    /// Sequence form: each handler after the first consumes its predecessor
    Chained,
}

/// One parsed handler module declaration
#[derive(Debug, Clone)]
pub struct HandlerSpec {
    pub key: String,
    pub handler_type: String,
    pub config: ModuleConfig,
    pub filter: ModuleConfig,
}

/// Parsed `handlers` section of a policy
#[derive(Debug, Clone)]
pub struct HandlerChainSpec {
    pub form: ChainForm,
    pub window: ModuleConfig,
    pub modules: Vec<HandlerSpec>,
}

impl HandlerChainSpec {
    pub fn is_chained(&self) -> bool {
        self.form == ChainForm::Chained
    }
}

fn invalid(message: &str) -> CoreError {
    CoreError::InvalidConfig(message.to_string())
}

fn parse_module(key: &str, body: &Map<String, Value>) -> CoreResult<HandlerSpec> {
    let handler_type = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing or invalid stream handler type at key 'type'"))?;
    let config = ModuleConfig::from_value(
        body.get("config").unwrap_or(&Value::Null),
        "stream handler configuration is not a map",
    )?;
    let filter = ModuleConfig::from_value(
        body.get("filter").unwrap_or(&Value::Null),
        "stream handler filter configuration is not a map",
    )?;
    Ok(HandlerSpec {
        key: key.to_string(),
        handler_type: handler_type.to_string(),
        config,
        filter,
    })
}

/// Parse a policy `handlers` section.
///
/// `modules` as a map gives the unordered form. As a sequence, each entry's
/// first key is the module key; its body is that key's map value, or the
/// rest of the entry when the key has no value. A keyed map body must be
/// the only key of its entry.
pub fn parse_chain(handlers: &Value) -> CoreResult<HandlerChainSpec> {
    let section = handlers
        .as_object()
        .ok_or_else(|| invalid("missing or invalid handler configuration at key 'handlers'"))?;

    let window = ModuleConfig::from_value(
        section.get("window_config").unwrap_or(&Value::Null),
        "stream handler window configuration is not a map",
    )?;

    let (form, modules) = match section.get("modules") {
        Some(Value::Object(map)) => {
            let mut modules = Vec::with_capacity(map.len());
            for (key, body) in map {
                let body = body
                    .as_object()
                    .ok_or_else(|| invalid("expecting stream handler module map"))?;
                modules.push(parse_module(key, body)?);
            }
            (ChainForm::Unordered, modules)
        }
        Some(Value::Array(entries)) => {
            let mut modules = Vec::with_capacity(entries.len());
            for entry in entries {
                let entry = entry
                    .as_object()
                    .ok_or_else(|| invalid("expecting stream handler module map"))?;
                let (key, value) = entry
                    .iter()
                    .next()
                    .ok_or_else(|| invalid("expecting stream handler module map"))?;
                let spec = match value {
                    Value::Object(body) if entry.len() == 1 => parse_module(key, body)?,
                    Value::Null => {
                        let mut rest = entry.clone();
                        rest.remove(key);
                        parse_module(key, &rest)?
                    }
                    _ => return Err(invalid("expecting stream handler module map")),
                };
                modules.push(spec);
            }
            (ChainForm::Chained, modules)
        }
        _ => {
            return Err(invalid(
                "missing or invalid handler modules at key 'modules'",
            ))
        }
    };

    if modules.is_empty() {
        return Err(invalid("policy has no stream handler modules"));
    }

    Ok(HandlerChainSpec {
        form,
        window,
        modules,
    })
}

/// Registry of live stream handlers
pub struct HandlerManager {
    plugins: Arc<PluginRegistry>,
    handlers: ModuleStore<dyn StreamHandler>,
    window_defaults: RwLock<ModuleConfig>,
}

impl HandlerManager {
    pub fn new(plugins: Arc<PluginRegistry>) -> Self {
        Self {
            plugins,
            handlers: ModuleStore::new(),
            window_defaults: RwLock::new(ModuleConfig::new()),
        }
    }

    /// Window keys applied under each policy's `window_config`; affects
    /// handlers created afterwards
    pub fn set_window_defaults(&self, defaults: ModuleConfig) {
        *self.window_defaults.write() = defaults;
    }

    pub fn window_defaults(&self) -> ModuleConfig {
        self.window_defaults.read().clone()
    }

    /// Create, register and start every handler of a policy.
    ///
    /// Returns the handler names in declared order. On failure everything
    /// this call created has been stopped and removed again.
    pub async fn instantiate_chain(
        &self,
        policy: &str,
        chain: &HandlerChainSpec,
        input: &InputAttachment,
    ) -> CoreResult<Vec<String>> {
        let mut created = Vec::with_capacity(chain.modules.len());
        match self.build_chain(policy, chain, input, &mut created).await {
            Ok(()) => Ok(created),
            Err(e) => {
                warn!(policy = %policy, error = %e, "Rolling back stream handlers");
                self.remove_chain(&created).await;
                Err(e)
            }
        }
    }

    async fn build_chain(
        &self,
        policy: &str,
        chain: &HandlerChainSpec,
        input: &InputAttachment,
        created: &mut Vec<String>,
    ) -> CoreResult<()> {
        let window = self.window_defaults().merged(&chain.window);
        let mut previous: Option<UpstreamHandler> = None;
        for spec in &chain.modules {
            let factory = self.plugins.handler(&spec.handler_type).ok_or_else(|| {
                CoreError::NotFound(format!(
                    "Policy '{}' requires stream handler type '{}' which is not available",
                    policy, spec.handler_type
                ))
            })?;

            let config = window.merged(&spec.config).merged(&spec.filter);
            let name = format!("{}-{}", policy, spec.key);
            let upstream = if chain.is_chained() {
                previous.as_ref()
            } else {
                None
            };

            let handler = factory.instantiate(&name, input, &config, upstream)?;
            let link = UpstreamHandler {
                name: name.clone(),
                handler_type: handler.schema_key().to_string(),
                output: handler.output(),
            };
            self.handlers.add(handler).map_err(|e| {
                e.context(format!(
                    "policy [{}] creation failed (handler: {})",
                    policy, name
                ))
            })?;
            created.push(name);
            previous = Some(link);
        }

        for name in created.iter() {
            let mut handler = self.handlers.get_locked(name).await?;
            handler
                .start()
                .await
                .map_err(|e| e.context(format!("policy [{}] failed to start", policy)))?;
            debug!(handler = %name, "Stream handler started");
        }
        info!(policy = %policy, handlers = created.len(), "Stream handler chain started");
        Ok(())
    }

    /// Stop and remove handlers in reverse order
    pub async fn remove_chain(&self, names: &[String]) {
        for name in names.iter().rev() {
            if let Err(e) = self.handlers.remove(name).await {
                warn!(handler = %name, error = %e, "Failed to remove stream handler");
            }
        }
    }

    /// Stop and remove every handler
    pub async fn remove_all(&self) {
        let names = self.handlers.names();
        self.remove_chain(&names).await;
    }

    pub fn exists(&self, name: &str) -> bool {
        self.handlers.exists(name)
    }

    pub fn handlers(&self) -> &ModuleStore<dyn StreamHandler> {
        &self.handlers
    }
}
