//! Tap catalog
//!
//! A tap is a named capture-source template: an input type plus default
//! input configuration. Policies reference taps by name; the input stream
//! registry merges tap defaults with policy overrides.

use crate::configurable::ModuleConfig;
use crate::error::{CoreError, CoreResult};
use crate::input::InputStreamManager;
use crate::module::Module;
use crate::plugins::PluginRegistry;
use crate::store::ModuleStore;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// A named capture-source template
#[derive(Debug, Clone)]
pub struct Tap {
    name: String,
    input_type: String,
    config: ModuleConfig,
    running: bool,
}

impl Tap {
    pub fn new(name: impl Into<String>, input_type: impl Into<String>, config: ModuleConfig) -> Self {
        Self {
            name: name.into(),
            input_type: input_type.into(),
            config,
            running: false,
        }
    }

    pub fn input_type(&self) -> &str {
        &self.input_type
    }

    /// Parse one catalog entry
    fn from_entry(name: &str, entry: &Value) -> CoreResult<Self> {
        let entry = entry.as_object().ok_or_else(|| {
            CoreError::InvalidConfig(format!("tap '{}' configuration is not a map", name))
        })?;
        let input_type = entry
            .get("input_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::InvalidConfig("missing or invalid tap type key 'input_type'".to_string())
            })?;
        let config = ModuleConfig::from_value(
            entry.get("config").unwrap_or(&Value::Null),
            "tap configuration is not a map",
        )
        .map_err(|e| e.context(format!("invalid tap config for tap '{}'", name)))?;

        Ok(Self::new(name, input_type, config))
    }
}

#[async_trait]
impl Module for Tap {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema_key(&self) -> &str {
        "tap"
    }

    fn running(&self) -> bool {
        self.running
    }

    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    async fn start(&mut self) -> CoreResult<()> {
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> CoreResult<()> {
        self.running = false;
        Ok(())
    }

    fn info_json(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "input_type": self.input_type,
            "config": self.config.to_json(),
        })
    }
}

/// Catalog of taps
pub struct TapManager {
    plugins: Arc<PluginRegistry>,
    inputs: Arc<InputStreamManager>,
    taps: ModuleStore<Tap>,
}

impl TapManager {
    pub fn new(plugins: Arc<PluginRegistry>, inputs: Arc<InputStreamManager>) -> Self {
        Self {
            plugins,
            inputs,
            taps: ModuleStore::new(),
        }
    }

    /// Load a `taps` configuration map.
    ///
    /// Every entry is validated before any is added, so a failing call adds
    /// nothing. With `strict` unset, taps whose input type has no factory are
    /// skipped with a warning instead of failing the load.
    pub async fn load(&self, config: &Value, strict: bool) -> CoreResult<Vec<String>> {
        let entries = config.as_object().ok_or_else(|| {
            CoreError::InvalidConfig("expecting tap configuration map".to_string())
        })?;

        let mut parsed = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            let tap = Tap::from_entry(name, entry)?;
            if self.taps.exists(name) {
                return Err(CoreError::NameConflict(format!(
                    "tap with name '{}' already defined",
                    name
                )));
            }
            if self.plugins.input(&tap.input_type).is_none() {
                if strict {
                    return Err(CoreError::NotFound(format!(
                        "tap '{}' requires input stream type '{}' which is not available",
                        name, tap.input_type
                    )));
                }
                warn!(tap = %name, input_type = %tap.input_type, "Input type not available, skipping tap");
                continue;
            }
            parsed.push(tap);
        }

        let mut loaded: Vec<String> = Vec::with_capacity(parsed.len());
        for mut tap in parsed {
            let name = tap.name.clone();
            tap.start().await?;
            if self.taps.add(Box::new(tap)).is_err() {
                for added in loaded.iter().rev() {
                    if let Err(e) = self.taps.remove(added).await {
                        warn!(tap = %added, error = %e, "Failed to remove tap during rollback");
                    }
                }
                return Err(CoreError::NameConflict(format!(
                    "tap with name '{}' already defined",
                    name
                )));
            }
            info!(tap = %name, "Tap loaded");
            loaded.push(name);
        }
        Ok(loaded)
    }

    /// Copy of a tap's definition
    pub async fn resolve(&self, name: &str) -> CoreResult<Tap> {
        if !self.taps.exists(name) {
            return Err(CoreError::NotFound(format!("tap '{}' does not exist", name)));
        }
        self.taps
            .with_locked(name, |tap| tap.clone())
            .await
            .map_err(|_| CoreError::NotFound(format!("tap '{}' does not exist", name)))
    }

    /// Remove a tap that no input stream references
    pub async fn remove_tap(&self, name: &str) -> CoreResult<()> {
        if !self.taps.exists(name) {
            return Err(CoreError::NotFound(format!("tap '{}' does not exist", name)));
        }
        let users = self.inputs.streams_for_tap(name).await;
        if let Some(stream) = users.first() {
            return Err(CoreError::InUse(format!(
                "tap '{}' is in use by input stream '{}'",
                name, stream
            )));
        }
        self.taps.remove(name).await?;
        info!(tap = %name, "Tap removed");
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.taps.exists(name)
    }

    pub fn taps(&self) -> &ModuleStore<Tap> {
        &self.taps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_plugins;
    use serde_json::json;

    fn manager() -> TapManager {
        let plugins = test_plugins();
        let inputs = Arc::new(InputStreamManager::new(plugins.clone()));
        TapManager::new(plugins, inputs)
    }

    #[tokio::test]
    async fn test_load_and_resolve() {
        let taps = manager();
        let loaded = taps
            .load(
                &json!({
                    "anycast": {"input_type": "null", "config": {"iface": "eth0"}},
                    "other": {"input_type": "null"}
                }),
                true,
            )
            .await
            .unwrap();
        assert_eq!(loaded, vec!["anycast", "other"]);

        let tap = taps.resolve("anycast").await.unwrap();
        assert_eq!(tap.input_type(), "null");
        assert_eq!(tap.config().get_string("iface").as_deref(), Some("eth0"));

        let err = taps.resolve("nonexist").await.unwrap_err();
        assert_eq!(err.to_string(), "tap 'nonexist' does not exist");
    }

    #[tokio::test]
    async fn test_load_rejects_malformed() {
        let taps = manager();
        let err = taps.load(&json!(["anycast"]), true).await.unwrap_err();
        assert_eq!(err.to_string(), "expecting tap configuration map");

        let err = taps
            .load(&json!({"anycast": {"config": {}}}), true)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "missing or invalid tap type key 'input_type'");

        let err = taps
            .load(&json!({"anycast": {"input_type": "null", "config": "eth0"}}), true)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid tap config for tap 'anycast': tap configuration is not a map"
        );
        assert!(taps.taps().is_empty());
    }

    #[tokio::test]
    async fn test_load_duplicate_is_atomic() {
        let taps = manager();
        taps.load(&json!({"anycast": {"input_type": "null"}}), true)
            .await
            .unwrap();

        let err = taps
            .load(
                &json!({"fresh": {"input_type": "null"}, "anycast": {"input_type": "null"}}),
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NameConflict);
        assert_eq!(err.to_string(), "tap with name 'anycast' already defined");
        assert!(!taps.exists("fresh"));
    }

    #[tokio::test]
    async fn test_unknown_input_type_strictness() {
        let taps = manager();
        let config = json!({"pcap_tap": {"input_type": "pcap"}, "ok": {"input_type": "null"}});

        let err = taps.load(&config, true).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(taps.taps().is_empty());

        let loaded = taps.load(&config, false).await.unwrap();
        assert_eq!(loaded, vec!["ok"]);
        assert!(!taps.exists("pcap_tap"));
    }

    #[tokio::test]
    async fn test_remove_tap_in_use() {
        let taps = manager();
        taps.load(&json!({"anycast": {"input_type": "null"}}), true)
            .await
            .unwrap();
        let tap = taps.resolve("anycast").await.unwrap();
        let acquired = taps
            .inputs
            .get_or_create(
                "default_view",
                crate::input::InputRequest {
                    tap: Some(&tap),
                    input_type: None,
                    config: &ModuleConfig::new(),
                    filter: &ModuleConfig::new(),
                },
            )
            .await
            .unwrap();

        let err = taps.remove_tap("anycast").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InUse);

        taps.inputs
            .release(acquired.reference, &acquired.name)
            .await
            .unwrap();
        taps.remove_tap("anycast").await.unwrap();
        assert!(!taps.exists("anycast"));
        assert!(taps.remove_tap("anycast").await.is_err());
    }
}
