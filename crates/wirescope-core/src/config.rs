//! Configuration file handling
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - YAML parsing with serde
//! - Environment variable overrides
//! - Schema and version validation

use serde::{Deserialize, Serialize};
use crate::configurable::ModuleConfig;
use crate::window::MAX_NUM_PERIODS;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// The only configuration schema version understood
pub const SCHEMA_VERSION: &str = "1.0";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Process-level settings from `wirescope.config`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Shorthand for `log_level: debug`
    pub verbose: bool,

    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Host the control API binds to
    pub host: String,

    /// Port the control API binds to
    pub port: u16,

    /// Allow policies to be created and removed over the API
    pub admin_api: bool,

    /// Serve Prometheus metrics at `/metrics`
    pub prometheus: bool,

    /// Value of the `instance` label on Prometheus samples
    pub prom_instance: Option<String>,

    /// Default number of retained window periods for every handler
    pub periods: Option<u64>,

    /// Default deep sampling percentage for every handler
    pub max_deep_sample: Option<u64>,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            verbose: false,
            log_level: "info".to_string(),
            host: "127.0.0.1".to_string(),
            port: 10853,
            admin_api: false,
            prometheus: false,
            prom_instance: None,
            periods: None,
            max_deep_sample: None,
        }
    }
}

impl SensorSettings {
    /// Window keys every policy's `window_config` is overlaid on
    pub fn window_defaults(&self) -> ModuleConfig {
        let mut defaults = ModuleConfig::new();
        if let Some(periods) = self.periods {
            defaults.set("num_periods", periods);
        }
        if let Some(rate) = self.max_deep_sample {
            defaults.set("deep_sample_rate", rate);
        }
        defaults
    }
}

/// A parsed configuration document
#[derive(Debug, Clone, Default)]
pub struct WirescopeConfig {
    pub settings: SensorSettings,
    /// Raw `taps` section, handed to the tap catalog
    pub taps: Option<Value>,
    /// Raw `policies` section, handed to the policy orchestrator
    pub policies: Option<Value>,
}

#[derive(Deserialize)]
struct RawDocument {
    version: Option<Value>,
    wirescope: Option<RawRoot>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RawRoot {
    config: Option<SensorSettings>,
    taps: Option<Value>,
    policies: Option<Value>,
}

/// Parse a YAML configuration document.
///
/// The document must carry `version: "1.0"` and a `wirescope` root map.
pub fn parse_document(content: &str) -> ConfigResult<WirescopeConfig> {
    let raw: RawDocument = serde_yaml::from_str(content)?;

    let version = match &raw.version {
        Some(Value::String(v)) => v.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(ConfigError::ValidationError(
                "missing or unsupported schema version".to_string(),
            ))
        }
    };
    if version != SCHEMA_VERSION {
        return Err(ConfigError::ValidationError(format!(
            "unsupported schema version: {}",
            version
        )));
    }

    let root = raw.wirescope.ok_or_else(|| {
        ConfigError::ValidationError("missing 'wirescope' root section".to_string())
    })?;

    Ok(WirescopeConfig {
        settings: root.config.unwrap_or_default(),
        taps: root.taps.filter(|v| !v.is_null()),
        policies: root.policies.filter(|v| !v.is_null()),
    })
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. WIRESCOPE_CONFIG environment variable
    /// 3. ~/.config/wirescope/config.yaml
    /// 4. /etc/wirescope/config.yaml
    /// 5. Default values
    ///
    /// A path given on the command line must exist.
    pub fn load(&self) -> ConfigResult<WirescopeConfig> {
        if let Some(path) = &self.cli_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.clone()));
            }
        }

        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                WirescopeConfig::default()
            }
        };

        self.apply_env_overrides(&mut config.settings);
        self.validate(&config.settings)?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            return Some(path.clone());
        }

        if let Ok(env_path) = std::env::var("WIRESCOPE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("WIRESCOPE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/wirescope/config.yaml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load and parse a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<WirescopeConfig> {
        let content = std::fs::read_to_string(path)?;
        parse_document(&content)
    }

    fn apply_env_overrides(&self, settings: &mut SensorSettings) {
        if let Ok(val) = std::env::var("WIRESCOPE_LOG_LEVEL") {
            settings.log_level = val;
        }
        if let Ok(val) = std::env::var("WIRESCOPE_WEB_HOST") {
            settings.host = val;
        }
        if let Ok(val) = std::env::var("WIRESCOPE_WEB_PORT") {
            if let Ok(port) = val.parse() {
                settings.port = port;
            }
        }
        if let Ok(val) = std::env::var("WIRESCOPE_ADMIN_API") {
            settings.admin_api = val.parse().unwrap_or(settings.admin_api);
        }
    }

    fn validate(&self, settings: &SensorSettings) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&settings.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                settings.log_level, valid_levels
            )));
        }

        if settings.port == 0 {
            return Err(ConfigError::ValidationError(
                "Web port cannot be 0".to_string(),
            ));
        }

        if let Some(periods) = settings.periods {
            if periods == 0 || periods > MAX_NUM_PERIODS as u64 {
                return Err(ConfigError::ValidationError(format!(
                    "periods must be between 1 and {}",
                    MAX_NUM_PERIODS
                )));
            }
        }

        if settings.max_deep_sample.is_some_and(|rate| rate > 100) {
            return Err(ConfigError::ValidationError(
                "max_deep_sample must be between 0 and 100".to_string(),
            ));
        }

        Ok(())
    }

    /// Default per-user config file location
    pub fn default_config_path() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|d| d.join("wirescope").join("config.yaml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
