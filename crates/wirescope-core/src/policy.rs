//! Policy orchestrator
//!
//! A policy binds one input stream to an ordered chain of stream handlers.
//! Loading a policy is a transaction: the input stream is resolved or
//! created, the handler chain is built and started, and only then is the
//! policy committed. Any failure unwinds everything the policy created.

use crate::configurable::ModuleConfig;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::handler::{parse_chain, HandlerManager, StreamHandler};
use crate::input::{InputAcquisition, InputRef, InputRequest, InputStreamManager, ManagedInputStream};
use crate::module::Module;
use crate::store::{ModuleGuard, ModuleHandle, ModuleStore};
use crate::tap::TapManager;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Policy kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Collection,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Collection => "collection",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collection" => Ok(PolicyKind::Collection),
            other => Err(CoreError::InvalidConfig(format!(
                "unknown policy kind: {}",
                other
            ))),
        }
    }
}

/// A committed policy: its input stream and ordered handlers
pub struct Policy {
    name: String,
    kind: PolicyKind,
    config: ModuleConfig,
    running: bool,
    input_name: String,
    input: ModuleHandle<ManagedInputStream>,
    input_ref: InputRef,
    handler_names: Vec<String>,
    handlers: Vec<ModuleHandle<dyn StreamHandler>>,
}

impl Policy {
    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn input_stream(&self) -> &ModuleHandle<ManagedInputStream> {
        &self.input
    }

    /// Handler names in declared order
    pub fn module_names(&self) -> &[String] {
        &self.handler_names
    }

    /// Handlers in declared order
    pub fn modules(&self) -> &[ModuleHandle<dyn StreamHandler>] {
        &self.handlers
    }
}

#[async_trait]
impl Module for Policy {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema_key(&self) -> &str {
        "policy"
    }

    fn running(&self) -> bool {
        self.running
    }

    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    async fn start(&mut self) -> CoreResult<()> {
        if self.running {
            return Ok(());
        }
        {
            let mut input = self.input.lock().await;
            input.set_active(self.input_ref, true);
            if !input.running() {
                input.start().await?;
            }
        }
        for handler in &self.handlers {
            let mut handler = handler.lock().await;
            if !handler.running() {
                handler.start().await?;
            }
        }
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> CoreResult<()> {
        if !self.running {
            return Ok(());
        }
        for (handler, name) in self.handlers.iter().zip(&self.handler_names).rev() {
            let mut handler = handler.lock().await;
            if handler.running() {
                if let Err(e) = handler.stop().await {
                    warn!(handler = %name, error = %e, "Error stopping stream handler");
                }
            }
        }
        {
            // the reference is kept until the policy is removed
            let mut input = self.input.lock().await;
            input.set_active(self.input_ref, false);
            if input.active_count() == 0 && input.running() {
                if let Err(e) = input.stop().await {
                    warn!(input = %self.input_name, error = %e, "Error stopping input stream");
                }
            }
        }
        self.running = false;
        info!(policy = %self.name, "Policy stopped");
        Ok(())
    }

    fn info_json(&self) -> Value {
        json!({
            "name": self.name,
            "kind": self.kind.as_str(),
            "running": self.running,
            "input": self.input_name,
            "modules": self.handler_names,
        })
    }
}

/// Registry of committed policies
pub struct PolicyManager {
    taps: Arc<TapManager>,
    inputs: Arc<InputStreamManager>,
    handlers: Arc<HandlerManager>,
    policies: ModuleStore<Policy>,
    // One load or removal at a time, so a name check holds until commit
    transactions: Mutex<()>,
}

impl PolicyManager {
    pub fn new(
        taps: Arc<TapManager>,
        inputs: Arc<InputStreamManager>,
        handlers: Arc<HandlerManager>,
    ) -> Self {
        Self {
            taps,
            inputs,
            handlers,
            policies: ModuleStore::new(),
            transactions: Mutex::new(()),
        }
    }

    /// Load a `policies` configuration map.
    ///
    /// Policies apply in declared order, each one atomically. The first
    /// failure is returned; policies committed before it stay committed.
    pub async fn load(&self, config: &Value) -> CoreResult<Vec<String>> {
        let entries = config.as_object().ok_or_else(expecting_map)?;

        let mut loaded = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            self.load_policy(name, entry).await?;
            loaded.push(name.clone());
        }
        Ok(loaded)
    }

    async fn load_policy(&self, name: &str, entry: &Value) -> CoreResult<()> {
        let _transaction = self.transactions.lock().await;
        if self.policies.exists(name) {
            return Err(CoreError::NameConflict(format!(
                "policy with name '{}' already defined",
                name
            )));
        }
        let entry = entry.as_object().ok_or_else(expecting_map)?;

        let kind = match entry.get("kind") {
            Some(Value::String(kind)) => kind.parse::<PolicyKind>()?,
            Some(other) => {
                return Err(CoreError::InvalidConfig(format!(
                    "unknown policy kind: {}",
                    other
                )))
            }
            None => {
                return Err(CoreError::InvalidConfig(
                    "missing or invalid policy kind at key 'kind'".to_string(),
                ))
            }
        };

        let input = entry
            .get("input")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                CoreError::InvalidConfig(
                    "missing or invalid policy input stream configuration at key 'input'"
                        .to_string(),
                )
            })?;
        let tap_name = optional_str(input, "tap")?;
        let input_type = optional_str(input, "input_type")?;
        let source = tap_name.or(input_type).unwrap_or_default();

        let input_config = ModuleConfig::from_value(
            input.get("config").unwrap_or(&Value::Null),
            "input configuration is not a map",
        )
        .map_err(|e| e.context(format!("invalid input config for tap '{}'", source)))?;
        let input_filter = ModuleConfig::from_value(
            input.get("filter").unwrap_or(&Value::Null),
            "input filter configuration is not a map",
        )
        .map_err(|e| e.context(format!("invalid input filter for tap '{}'", source)))?;

        let tap = match tap_name {
            Some(tap) => Some(self.taps.resolve(tap).await?),
            None => None,
        };

        let acquired = self
            .inputs
            .get_or_create(
                name,
                InputRequest {
                    tap: tap.as_ref(),
                    input_type,
                    config: &input_config,
                    filter: &input_filter,
                },
            )
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::TypeMismatch | ErrorKind::NotFound if tap_name.is_some() => {
                    e.context(format!("unable to instantiate tap '{}'", source))
                }
                ErrorKind::RuntimeStartFailure => {
                    e.context(format!("policy [{}] failed to start", name))
                }
                _ => e,
            })?;

        let handler_names = match self.build_handlers(name, entry, &acquired).await {
            Ok(names) => names,
            Err(e) => {
                self.rollback_input(name, &acquired).await;
                return Err(e);
            }
        };

        let mut handler_handles = Vec::with_capacity(handler_names.len());
        for handler in &handler_names {
            match self.handlers.handlers().get(handler) {
                Ok(handle) => handler_handles.push(handle),
                Err(e) => {
                    self.handlers.remove_chain(&handler_names).await;
                    self.rollback_input(name, &acquired).await;
                    return Err(e);
                }
            }
        }

        let mut policy_config = ModuleConfig::new();
        policy_config.set("kind", kind.as_str());
        policy_config.set("input", &acquired.name);

        let mut policy = Policy {
            name: name.to_string(),
            kind,
            config: policy_config,
            running: false,
            input_name: acquired.name.clone(),
            input: acquired.handle.clone(),
            input_ref: acquired.reference,
            handler_names: handler_names.clone(),
            handlers: handler_handles,
        };

        let committed = match policy.start().await {
            Ok(()) => self.policies.add(Box::new(policy)),
            Err(e) => Err(e.context(format!("policy [{}] failed to start", name))),
        };
        if let Err(e) = committed {
            self.handlers.remove_chain(&handler_names).await;
            self.rollback_input(name, &acquired).await;
            return Err(e);
        }

        info!(
            policy = %name,
            input = %acquired.name,
            handlers = ?handler_names,
            "Policy loaded"
        );
        Ok(())
    }

    async fn build_handlers(
        &self,
        policy: &str,
        entry: &Map<String, Value>,
        acquired: &InputAcquisition,
    ) -> CoreResult<Vec<String>> {
        let chain = parse_chain(entry.get("handlers").unwrap_or(&Value::Null))?;
        self.handlers
            .instantiate_chain(policy, &chain, &acquired.attachment())
            .await
    }

    async fn rollback_input(&self, policy: &str, acquired: &InputAcquisition) {
        if let Err(e) = self.inputs.release(acquired.reference, &acquired.name).await {
            warn!(policy = %policy, input = %acquired.name, error = %e, "Failed to release input stream during rollback");
        }
        warn!(policy = %policy, "Policy rolled back");
    }

    /// Stop a policy and remove it with its handlers and input reference
    pub async fn remove_policy(&self, name: &str) -> CoreResult<()> {
        let _transaction = self.transactions.lock().await;
        let (input_name, input_ref, handler_names) = {
            let mut policy = self.policies.get_locked(name).await.map_err(|_| {
                CoreError::NotFound(format!("policy '{}' does not exist", name))
            })?;
            policy.stop().await?;
            (
                policy.input_name().to_string(),
                policy.input_ref,
                policy.module_names().to_vec(),
            )
        };

        self.handlers.remove_chain(&handler_names).await;
        if let Err(e) = self.inputs.release(input_ref, &input_name).await {
            warn!(policy = %name, input = %input_name, error = %e, "Failed to release input stream");
        }
        self.policies.remove(name).await?;
        info!(policy = %name, "Policy removed");
        Ok(())
    }

    /// Remove every policy, newest first
    pub async fn remove_all(&self) {
        for name in self.policies.names().into_iter().rev() {
            if let Err(e) = self.remove_policy(&name).await {
                warn!(policy = %name, error = %e, "Failed to remove policy");
            }
        }
    }

    pub fn module_exists(&self, name: &str) -> bool {
        self.policies.exists(name)
    }

    pub async fn module_get_locked(&self, name: &str) -> CoreResult<ModuleGuard<Policy>> {
        self.policies.get_locked(name).await
    }

    pub fn policies(&self) -> &ModuleStore<Policy> {
        &self.policies
    }
}

fn expecting_map() -> CoreError {
    CoreError::InvalidConfig("expecting policy configuration map".to_string())
}

fn optional_str<'a>(map: &'a Map<String, Value>, key: &str) -> CoreResult<Option<&'a str>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(CoreError::InvalidConfig(format!(
            "invalid value for key: {}",
            key
        ))),
    }
}
