//! Input stream registry
//!
//! Live capture sources, keyed by a fingerprint of the tap they came from
//! and their effective configuration. Policies asking for an identical
//! source share one running instance; the instance goes away when the last
//! policy referencing it is released.

use crate::configurable::{canonical_json, ModuleConfig};
use crate::error::{CoreError, CoreResult};
use crate::events::EventSender;
use crate::module::Module;
use crate::plugins::{InputAttachment, PluginRegistry};
use crate::store::{ModuleHandle, ModuleStore};
use crate::tap::Tap;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A capture source producing packet events.
///
/// `schema_key()` is the input type.
pub trait InputStream: Module {
    /// Bus the stream publishes decoded packets on
    fn events(&self) -> EventSender;
}

/// One policy's claim on a shared input stream.
///
/// Every acquisition gets its own token, so releasing one claim never drops
/// another, even when both carry the same policy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputRef(u64);

#[derive(Debug)]
struct Reference {
    id: InputRef,
    policy: String,
    active: bool,
}

/// An input stream plus the registry's bookkeeping for it
pub struct ManagedInputStream {
    tap: Option<String>,
    references: Vec<Reference>,
    stream: Box<dyn InputStream>,
}

impl ManagedInputStream {
    fn new(tap: Option<String>, stream: Box<dyn InputStream>) -> Self {
        Self {
            tap,
            references: Vec::new(),
            stream,
        }
    }

    /// Tap this stream was instantiated from, if any
    pub fn tap(&self) -> Option<&str> {
        self.tap.as_deref()
    }

    pub fn input_type(&self) -> &str {
        self.stream.schema_key()
    }

    pub fn events(&self) -> EventSender {
        self.stream.events()
    }

    /// Policies holding a reference to this stream, running or not
    pub fn policies(&self) -> Vec<&str> {
        self.references.iter().map(|r| r.policy.as_str()).collect()
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    /// References whose policy is currently running
    pub fn active_count(&self) -> usize {
        self.references.iter().filter(|r| r.active).count()
    }

    fn add_reference(&mut self, id: InputRef, policy: &str) {
        self.references.push(Reference {
            id,
            policy: policy.to_string(),
            active: true,
        });
    }

    fn drop_reference(&mut self, id: InputRef) -> bool {
        let before = self.references.len();
        self.references.retain(|r| r.id != id);
        self.references.len() != before
    }

    /// Mark a reference as running or stopped. The reference itself stays
    /// until it is released.
    pub fn set_active(&mut self, id: InputRef, active: bool) {
        if let Some(reference) = self.references.iter_mut().find(|r| r.id == id) {
            reference.active = active;
        }
    }
}

#[async_trait]
impl Module for ManagedInputStream {
    fn name(&self) -> &str {
        self.stream.name()
    }

    fn schema_key(&self) -> &str {
        self.stream.schema_key()
    }

    fn running(&self) -> bool {
        self.stream.running()
    }

    fn config(&self) -> &ModuleConfig {
        self.stream.config()
    }

    async fn start(&mut self) -> CoreResult<()> {
        self.stream.start().await
    }

    async fn stop(&mut self) -> CoreResult<()> {
        self.stream.stop().await
    }

    fn info_json(&self) -> Value {
        let mut info = self.stream.info_json();
        if let Value::Object(map) = &mut info {
            map.insert("tap".to_string(), json!(self.tap));
            map.insert("policies".to_string(), json!(self.policies()));
        }
        info
    }
}

/// What a policy asks the registry for
#[derive(Debug, Clone, Copy)]
pub struct InputRequest<'a> {
    pub tap: Option<&'a Tap>,
    pub input_type: Option<&'a str>,
    pub config: &'a ModuleConfig,
    pub filter: &'a ModuleConfig,
}

/// Result of [`InputStreamManager::get_or_create`]
pub struct InputAcquisition {
    pub name: String,
    pub input_type: String,
    pub events: EventSender,
    pub handle: ModuleHandle<ManagedInputStream>,
    /// The caller's claim on the stream, handed back to `release`
    pub reference: InputRef,
    /// Whether this call created the stream
    pub created: bool,
}

impl InputAcquisition {
    pub fn attachment(&self) -> InputAttachment {
        InputAttachment {
            name: self.name.clone(),
            input_type: self.input_type.clone(),
            events: self.events.clone(),
        }
    }
}

/// First 8 bytes of SHA-256 over the canonical JSON of the stream identity
pub fn fingerprint(tap: Option<&str>, input_type: &str, config: &ModuleConfig) -> String {
    let identity = json!({
        "tap": tap,
        "input_type": input_type,
        "config": config.to_json(),
    });
    let digest = Sha256::digest(canonical_json(&identity).as_bytes());
    hex::encode(&digest[..8])
}

/// Registry of live input streams
pub struct InputStreamManager {
    plugins: Arc<PluginRegistry>,
    streams: ModuleStore<ManagedInputStream>,
    // Serializes creation and release so each fingerprint starts once
    lifecycle: Mutex<()>,
    next_reference: AtomicU64,
}

impl InputStreamManager {
    pub fn new(plugins: Arc<PluginRegistry>) -> Self {
        Self {
            plugins,
            streams: ModuleStore::new(),
            lifecycle: Mutex::new(()),
            next_reference: AtomicU64::new(1),
        }
    }

    /// Find the stream matching `request`, creating and starting it if needed,
    /// and record `policy` as a user of it.
    pub async fn get_or_create(
        &self,
        policy: &str,
        request: InputRequest<'_>,
    ) -> CoreResult<InputAcquisition> {
        let input_type = match (request.tap, request.input_type) {
            (Some(tap), Some(given)) if given != tap.input_type() => {
                return Err(CoreError::TypeMismatch(format!(
                    "input_type for policy specified tap '{}' doesn't match tap's defined input type: {}/{}",
                    tap.name(),
                    given,
                    tap.input_type()
                )));
            }
            (Some(tap), _) => tap.input_type().to_string(),
            (None, Some(given)) => given.to_string(),
            (None, None) => {
                return Err(CoreError::InvalidConfig(
                    "policy input must specify a tap or an input_type".to_string(),
                ));
            }
        };
        let factory = self.plugins.input(&input_type).ok_or_else(|| {
            CoreError::NotFound(format!(
                "input stream type '{}' is not available",
                input_type
            ))
        })?;

        let mut effective = request
            .tap
            .map(|tap| tap.config().clone())
            .unwrap_or_default();
        effective.merge(request.config);
        effective.merge(request.filter);

        let tap_name = request.tap.map(|tap| tap.name().to_string());
        let fp = fingerprint(tap_name.as_deref(), &input_type, &effective);
        let name = format!("{}-{}", tap_name.as_deref().unwrap_or(&input_type), fp);

        let _lifecycle = self.lifecycle.lock().await;
        let reference = InputRef(self.next_reference.fetch_add(1, Ordering::Relaxed));

        if let Ok(handle) = self.streams.get(&name) {
            let events = {
                let mut stream = handle.lock().await;
                stream.add_reference(reference, policy);
                if !stream.running() {
                    if let Err(e) = stream.start().await {
                        stream.drop_reference(reference);
                        return Err(e);
                    }
                    info!(input = %name, "Restarted shared input stream");
                }
                stream.events()
            };
            debug!(input = %name, policy = %policy, "Reusing input stream");
            return Ok(InputAcquisition {
                name,
                input_type,
                events,
                handle,
                reference,
                created: false,
            });
        }

        let stream = factory.instantiate(&name, &effective)?;
        let mut managed = ManagedInputStream::new(tap_name, stream);
        managed.add_reference(reference, policy);
        self.streams.add(Box::new(managed))?;
        let handle = self.streams.get(&name)?;

        let started = {
            let mut stream = handle.lock().await;
            stream.start().await.map(|_| stream.events())
        };
        let events = match started {
            Ok(events) => events,
            Err(e) => {
                if let Err(remove_err) = self.streams.remove(&name).await {
                    warn!(input = %name, error = %remove_err, "Failed to remove input stream after start failure");
                }
                return Err(e);
            }
        };

        info!(input = %name, input_type = %input_type, policy = %policy, "Input stream started");
        Ok(InputAcquisition {
            name,
            input_type,
            events,
            handle,
            reference,
            created: true,
        })
    }

    /// Drop one reference to a stream, removing the stream when none remain
    pub async fn release(&self, reference: InputRef, name: &str) -> CoreResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let handle = self.streams.get(name)?;
        let unused = {
            let mut stream = handle.lock().await;
            if !stream.drop_reference(reference) {
                warn!(input = %name, "Released an unknown input stream reference");
            }
            stream.reference_count() == 0
        };
        if unused {
            self.streams.remove(name).await?;
            info!(input = %name, "Input stream removed");
        }
        Ok(())
    }

    /// Names of streams instantiated from `tap`
    pub async fn streams_for_tap(&self, tap: &str) -> Vec<String> {
        let mut names = Vec::new();
        for handle in self.streams.enumerate() {
            let stream = handle.lock().await;
            if stream.tap() == Some(tap) {
                names.push(stream.name().to_string());
            }
        }
        names
    }

    /// Stop and remove every stream regardless of references
    pub async fn remove_all(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        for name in self.streams.names().into_iter().rev() {
            if let Err(e) = self.streams.remove(&name).await {
                warn!(input = %name, error = %e, "Failed to remove input stream");
            }
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.streams.exists(name)
    }

    pub fn streams(&self) -> &ModuleStore<ManagedInputStream> {
        &self.streams
    }
}
