//! Core registry
//!
//! Owns the plugin registry and the four managers, wired together. One
//! instance is created at startup and shared by `Arc` with the control API.

use crate::config::{parse_document, ConfigError, WirescopeConfig};
use crate::error::CoreError;
use crate::handler::HandlerManager;
use crate::input::InputStreamManager;
use crate::plugins::PluginRegistry;
use crate::policy::PolicyManager;
use crate::tap::TapManager;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Failure applying a configuration document
#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Names loaded by one configuration pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub taps: Vec<String>,
    pub policies: Vec<String>,
}

pub struct CoreRegistry {
    plugins: Arc<PluginRegistry>,
    taps: Arc<TapManager>,
    inputs: Arc<InputStreamManager>,
    handlers: Arc<HandlerManager>,
    policies: Arc<PolicyManager>,
}

impl CoreRegistry {
    pub fn new(plugins: PluginRegistry) -> Self {
        let plugins = Arc::new(plugins);
        let inputs = Arc::new(InputStreamManager::new(plugins.clone()));
        let taps = Arc::new(TapManager::new(plugins.clone(), inputs.clone()));
        let handlers = Arc::new(HandlerManager::new(plugins.clone()));
        let policies = Arc::new(PolicyManager::new(
            taps.clone(),
            inputs.clone(),
            handlers.clone(),
        ));
        Self {
            plugins,
            taps,
            inputs,
            handlers,
            policies,
        }
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn tap_manager(&self) -> &TapManager {
        &self.taps
    }

    pub fn input_manager(&self) -> &InputStreamManager {
        &self.inputs
    }

    pub fn handler_manager(&self) -> &HandlerManager {
        &self.handlers
    }

    pub fn policy_manager(&self) -> &PolicyManager {
        &self.policies
    }

    /// Load taps, then policies, from a parsed document
    pub async fn configure(&self, config: &WirescopeConfig) -> Result<LoadSummary, CoreError> {
        let mut summary = LoadSummary::default();
        let window_defaults = config.settings.window_defaults();
        if !window_defaults.is_empty() {
            debug!(defaults = %window_defaults.to_json(), "Applying handler window defaults");
            self.handlers.set_window_defaults(window_defaults);
        }
        if let Some(taps) = &config.taps {
            summary.taps = self.taps.load(taps, true).await?;
        }
        if let Some(policies) = &config.policies {
            summary.policies = self.policies.load(policies).await?;
        }
        info!(
            taps = summary.taps.len(),
            policies = summary.policies.len(),
            "Configuration applied"
        );
        Ok(summary)
    }

    pub async fn configure_from_str(&self, content: &str) -> Result<LoadSummary, ConfigureError> {
        let config = parse_document(content)?;
        Ok(self.configure(&config).await?)
    }

    pub async fn configure_file(&self, path: &Path) -> Result<LoadSummary, ConfigureError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::from)?;
        self.configure_from_str(&content).await
    }

    /// Remove every policy, then anything left running
    pub async fn teardown(&self) {
        self.policies.remove_all().await;
        self.handlers.remove_all().await;
        self.inputs.remove_all().await;
        info!("Registry torn down");
    }
}
