pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime_worker_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime_max_blocking_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tcp_reuse_port_listener_count: Option<usize>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_path: String::new(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
            tcp_reuse_port_listener_count: None,
        }
    }
}

/// Model tier names for one vendor.
///
/// The secondary vendor typically runs a single local model, so its mid and
/// heavy tiers default to the baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTiers {
    pub baseline: String,
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub heavy: Option<String>,
}

impl ModelTiers {
    #[must_use]
    pub fn mid(&self) -> &str {
        self.mid.as_deref().unwrap_or(&self.baseline)
    }

    #[must_use]
    pub fn heavy(&self) -> &str {
        self.heavy.as_deref().unwrap_or(&self.baseline)
    }
}

/// Endpoint configuration for one vendor backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorEndpointConfig {
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub models: ModelTiers,
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
}

fn default_max_streams() -> usize {
    8
}

/// Feature flags and collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_rules_file")]
    pub rules_file: String,
    /// Bearer-token → user-id map consumed from the auth collaborator.
    #[serde(default)]
    pub client_identities: Vec<ClientIdentity>,
    #[serde(default)]
    pub startup_vendor_pings: bool,
    #[serde(default = "default_startup_check_timeout")]
    pub startup_check_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub token: String,
    pub user_id: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_rules_file() -> String {
    "router_rules.yaml".to_string()
}
fn default_startup_check_timeout() -> u64 {
    10
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            rules_file: default_rules_file(),
            client_identities: Vec::new(),
            startup_vendor_pings: false,
            startup_check_timeout_secs: default_startup_check_timeout(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_primary")]
    pub primary: VendorEndpointConfig,
    #[serde(default = "default_secondary")]
    pub secondary: VendorEndpointConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

fn default_primary() -> VendorEndpointConfig {
    VendorEndpointConfig {
        base_url: "https://api.openai.com/v1".to_string(),
        api_key: None,
        models: ModelTiers {
            baseline: "gpt-4o-mini".to_string(),
            mid: Some("gpt-4o".to_string()),
            heavy: Some("gpt-4o".to_string()),
        },
        max_streams: 8,
    }
}

fn default_secondary() -> VendorEndpointConfig {
    VendorEndpointConfig {
        base_url: "http://localhost:11434".to_string(),
        api_key: None,
        models: ModelTiers {
            baseline: "llama3:latest".to_string(),
            mid: None,
            heavy: None,
        },
        max_streams: 2,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            primary: default_primary(),
            secondary: default_secondary(),
            features: FeaturesConfig::default(),
        }
    }
}

impl AppConfig {
    /// Apply environment overrides on top of file/default values.
    ///
    /// Environment always wins over the file, which wins over built-ins.
    pub fn apply_env_overrides(&mut self) {
        override_string("PRIMARY_BASE_URL", &mut self.primary.base_url);
        override_string("SECONDARY_BASE_URL", &mut self.secondary.base_url);
        if let Ok(key) = std::env::var("PRIMARY_API_KEY") {
            if !key.trim().is_empty() {
                self.primary.api_key = Some(key);
            }
        }
        override_string("PRIMARY_BASELINE_MODEL", &mut self.primary.models.baseline);
        override_opt_string("PRIMARY_MID_MODEL", &mut self.primary.models.mid);
        override_opt_string("PRIMARY_HEAVY_MODEL", &mut self.primary.models.heavy);
        override_string(
            "SECONDARY_DEFAULT_MODEL",
            &mut self.secondary.models.baseline,
        );
        override_usize("PRIMARY_MAX_STREAMS", &mut self.primary.max_streams);
        override_usize("SECONDARY_MAX_STREAMS", &mut self.secondary.max_streams);
        override_string("RULES_FILE", &mut self.features.rules_file);
        if crate::util::env_truthy("STARTUP_VENDOR_PINGS") {
            self.features.startup_vendor_pings = true;
        }
        if let Ok(raw) = std::env::var("STARTUP_CHECK_TIMEOUT") {
            if let Ok(parsed) = raw.trim().parse::<u64>() {
                self.features.startup_check_timeout_secs = parsed;
            }
        }
    }
}

fn override_string(key: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(key) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            *slot = trimmed.to_string();
        }
    }
}

fn override_opt_string(key: &str, slot: &mut Option<String>) {
    if let Ok(value) = std::env::var(key) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            *slot = Some(trimmed.to_string());
        }
    }
}

fn override_usize(key: &str, slot: &mut usize) {
    if let Ok(value) = std::env::var(key) {
        if let Ok(parsed) = value.trim().parse::<usize>() {
            *slot = parsed;
        }
    }
}

/// Load configuration from a YAML file when present, fall back to defaults,
/// then layer environment overrides and validate.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when an existing file fails to parse, or
/// [`ConfigError::Validation`] when semantic validation fails. A missing
/// file is not an error.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str(&contents)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(err) => return Err(ConfigError::Io(err)),
    };
    config.apply_env_overrides();
    validate_config(&config)?;
    Ok(config)
}
