use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level broker configuration.
///
/// Loaded from TOML (preferred) or JSON; every block has sensible defaults
/// so a missing file yields a working local setup (file storage, single
/// AWS provider instance).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub provider: ProviderConfig,
    pub aws: AwsClientConfig,
    pub launch_template: LaunchTemplateConfig,
    pub performance: PerformanceConfig,
    pub aws_metrics: AwsMetricsConfig,
    pub storage: StorageConfig,
    pub template: TemplateConfig,
    /// Package identity bound into native-spec rendering contexts.
    pub package_name: String,
    pub package_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Fallback default provider instance name.
    pub active_provider: Option<String>,
    pub selection_policy: SelectionPolicy,
    /// Cadence of background health probes, seconds.
    pub health_check_interval: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub providers: Vec<ProviderInstanceConfig>,
    /// Per-provider-type defaults, e.g. `provider_defaults.aws.template_defaults`.
    pub provider_defaults: HashMap<String, ProviderTypeDefaults>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderTypeDefaults {
    pub template_defaults: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionPolicy {
    FirstAvailable,
    RoundRobin,
    WeightedRoundRobin,
    FastestResponse,
    CapabilityBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a half-open probe.
    pub recovery_timeout: u64,
}

/// One named, configured incarnation of a provider type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstanceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Provider APIs this instance supports (e.g. "EC2Fleet", "ASG").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Opaque per-instance settings (region, profile, ...).
    #[serde(default)]
    pub config: serde_json::Value,
    /// Instance-level template field defaults (highest defaults layer).
    #[serde(default)]
    pub template_defaults: serde_json::Value,
}

impl ProviderInstanceConfig {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsClientConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
    pub max_retries: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchTemplateConfig {
    /// Fresh launch template per request when true; reuse otherwise.
    pub create_per_request: bool,
    pub naming_strategy: NamingStrategy,
    pub version_strategy: VersionStrategy,
    /// Look up by name before creating.
    pub reuse_existing: bool,
    pub max_versions_per_template: u32,
    pub cleanup_old_versions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingStrategy {
    RequestBased,
    TemplateBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStrategy {
    Incremental,
    Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub enable_batching: bool,
    pub batch_sizes: HashMap<String, usize>,
    pub enable_parallel: bool,
    pub max_workers: usize,
    pub enable_caching: bool,
    /// Template cache TTL, seconds.
    pub cache_ttl: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsMetricsConfig {
    pub aws_metrics_enabled: bool,
    /// Fraction of calls recorded, in [0, 1].
    pub sample_rate: f64,
    /// Service whitelist; empty means all.
    pub monitored_services: Vec<String>,
    /// Operation whitelist (snake_case); empty means all.
    pub monitored_operations: Vec<String>,
    pub track_payload_sizes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Registered strategy name: "file", "sql", "dynamodb" or "memory".
    pub backend: String,
    pub file_dir: PathBuf,
    pub sqlite_url: String,
    pub dynamodb_table_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Directory scanned for templates.json and override files.
    pub config_dir: PathBuf,
    /// Global template field defaults (lowest defaults layer).
    pub defaults: serde_json::Value,
    pub native_spec_enabled: bool,
    /// Directory native-spec *_file references resolve against.
    pub spec_dir: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

fn default_weight() -> u32 {
    1
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            active_provider: None,
            selection_policy: SelectionPolicy::FirstAvailable,
            health_check_interval: 60,
            circuit_breaker: CircuitBreakerConfig::default(),
            provider_defaults: HashMap::new(),
            providers: vec![ProviderInstanceConfig {
                name: "aws-default".to_string(),
                provider_type: "aws".to_string(),
                enabled: true,
                priority: 100,
                weight: 1,
                capabilities: vec![
                    "EC2Fleet".to_string(),
                    "SpotFleet".to_string(),
                    "ASG".to_string(),
                    "RunInstances".to_string(),
                ],
                config: serde_json::json!({}),
                template_defaults: serde_json::json!({}),
            }],
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { enabled: true, failure_threshold: 5, recovery_timeout: 60 }
    }
}

impl Default for AwsClientConfig {
    fn default() -> Self {
        Self {
            region: None,
            profile: None,
            max_retries: 3,
            connect_timeout_secs: 5,
            read_timeout_secs: 10,
        }
    }
}

impl Default for LaunchTemplateConfig {
    fn default() -> Self {
        Self {
            create_per_request: false,
            naming_strategy: NamingStrategy::RequestBased,
            version_strategy: VersionStrategy::Incremental,
            reuse_existing: true,
            max_versions_per_template: 10,
            cleanup_old_versions: false,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        let mut batch_sizes = HashMap::new();
        batch_sizes.insert("terminate_instances".to_string(), 50);
        batch_sizes.insert("describe_instances".to_string(), 100);
        Self {
            enable_batching: true,
            batch_sizes,
            enable_parallel: true,
            max_workers: 4,
            enable_caching: true,
            cache_ttl: 300,
        }
    }
}

impl Default for AwsMetricsConfig {
    fn default() -> Self {
        Self {
            aws_metrics_enabled: true,
            sample_rate: 1.0,
            monitored_services: Vec::new(),
            monitored_operations: Vec::new(),
            track_payload_sizes: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            file_dir: PathBuf::from("state"),
            sqlite_url: "sqlite://hostbroker.db".to_string(),
            dynamodb_table_prefix: "hostbroker_".to_string(),
        }
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
            defaults: serde_json::json!({}),
            native_spec_enabled: true,
            spec_dir: PathBuf::from("config/specs"),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            aws: AwsClientConfig::default(),
            launch_template: LaunchTemplateConfig::default(),
            performance: PerformanceConfig::default(),
            aws_metrics: AwsMetricsConfig::default(),
            storage: StorageConfig::default(),
            template: TemplateConfig::default(),
            package_name: env!("CARGO_PKG_NAME").to_string(),
            package_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from an explicit path, or fall back to
    /// `hostbroker.toml` in the working directory, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let local = PathBuf::from("hostbroker.toml");
                if local.exists() {
                    local
                } else {
                    return Ok(BrokerConfig::default());
                }
            }
        };

        if !config_path.exists() {
            if path.is_some() {
                tracing::warn!(
                    "Config file not found: {}, using defaults",
                    config_path.display()
                );
            }
            return Ok(BrokerConfig::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let is_json = config_path.extension().map(|e| e == "json").unwrap_or(false);
        if is_json {
            serde_json::from_str(&content).map_err(|e| {
                BrokerError::configuration_with_source(
                    format!("Failed to parse config: {}", config_path.display()),
                    e,
                )
            })
        } else {
            toml::from_str(&content).map_err(|e| {
                BrokerError::configuration_with_source(
                    format!("Failed to parse config: {}", config_path.display()),
                    e,
                )
            })
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            BrokerError::configuration_with_source("Failed to serialize config", e)
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn find_provider_instance(&self, name: &str) -> Option<&ProviderInstanceConfig> {
        self.provider.providers.iter().find(|p| p.name == name)
    }

    pub fn enabled_provider_instances(&self) -> impl Iterator<Item = &ProviderInstanceConfig> {
        self.provider.providers.iter().filter(|p| p.enabled)
    }
}

pub fn init_config(output: &Path) -> Result<()> {
    let config = BrokerConfig::default();
    config.save(output)?;
    println!("Created config file: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_one_enabled_aws_instance() {
        let config = BrokerConfig::default();
        assert_eq!(config.provider.providers.len(), 1);
        let instance = &config.provider.providers[0];
        assert!(instance.enabled);
        assert_eq!(instance.provider_type, "aws");
        assert!(instance.capabilities.iter().any(|c| c == "EC2Fleet"));
        assert_eq!(config.aws.connect_timeout_secs, 5);
        assert_eq!(config.aws.read_timeout_secs, 10);
    }

    #[test]
    fn config_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("hostbroker.toml");

        let config = BrokerConfig::default();
        config.save(&config_path).unwrap();

        let loaded = BrokerConfig::load(Some(&config_path)).unwrap();
        assert_eq!(loaded.provider.providers.len(), config.provider.providers.len());
        assert_eq!(loaded.launch_template.max_versions_per_template, 10);
    }

    #[test]
    fn json_config_is_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("hostbroker.json");
        std::fs::write(
            &config_path,
            r#"{"provider": {"selection_policy": "WEIGHTED_ROUND_ROBIN", "providers": []}}"#,
        )
        .unwrap();

        let loaded = BrokerConfig::load(Some(&config_path)).unwrap();
        assert_eq!(loaded.provider.selection_policy, SelectionPolicy::WeightedRoundRobin);
        assert!(loaded.provider.providers.is_empty());
    }

    #[test]
    fn invalid_toml_is_a_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("bad.toml");
        std::fs::write(&config_path, "not toml {").unwrap();

        let err = BrokerConfig::load(Some(&config_path)).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }
}
