//! Node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ratemesh_fx::provider::{PluginProviderConfig, RestProviderConfig};
use ratemesh_fx::{ResolverConfig, RetentionPolicy};
use serde::{Deserialize, Serialize};

/// Which cache backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

impl std::str::FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("Unknown cache backend {:?}", other)),
        }
    }
}

/// One configured provider, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Rest(RestProviderConfig),
    Plugin(PluginProviderConfig),
}

impl ProviderConfig {
    pub fn id(&self) -> &str {
        match self {
            ProviderConfig::Rest(c) => &c.descriptor.id,
            ProviderConfig::Plugin(c) => &c.descriptor.id,
        }
    }
}

/// Rate entered at startup into the manual provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualRateConfig {
    pub base: String,
    pub target: String,
    pub rate: f64,
}

/// Contents of the providers file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub manual_rates: Vec<ManualRateConfig>,
}

impl ProvidersFile {
    /// Read and parse a providers file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
        Self::parse(&raw).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let file: Self = serde_json::from_str(raw).map_err(|e| e.to_string())?;

        let mut seen = std::collections::BTreeSet::new();
        for provider in &file.providers {
            if !seen.insert(provider.id()) {
                return Err(format!("Duplicate provider id {:?}", provider.id()));
            }
        }
        Ok(file)
    }
}

/// Main node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Cache backend.
    pub cache_backend: CacheBackendKind,
    /// Redis URL, used with the Redis backend.
    pub redis_url: String,
    /// PostgreSQL URL. Without one the node keeps its store in memory.
    pub database_url: Option<String>,
    /// JSON providers file.
    pub providers_file: Option<PathBuf>,
    /// Resolver settings.
    pub resolver: ResolverConfig,
    /// How often the monitor checks for an elapsed hour.
    pub flush_check_interval: Duration,
    /// How often retention runs.
    pub retention_interval: Duration,
    pub retention: RetentionPolicy,
    /// Log level when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cache_backend: CacheBackendKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: None,
            providers_file: None,
            resolver: ResolverConfig::default(),
            flush_check_interval: Duration::from_secs(60),
            retention_interval: Duration::from_secs(6 * 60 * 60),
            retention: RetentionPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl NodeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(kind) = env_parse("RATEMESH_CACHE_BACKEND") {
            config.cache_backend = kind;
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = Some(url);
            }
        }

        if let Ok(path) = std::env::var("RATEMESH_PROVIDERS_FILE") {
            config.providers_file = Some(PathBuf::from(path));
        }

        if let Some(hops) = env_parse("RATEMESH_MAX_HOPS") {
            config.resolver.max_hops = hops;
        }

        if let Some(secs) = env_parse("RATEMESH_PROVIDER_TIMEOUT_SECS") {
            config.resolver.provider_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse("RATEMESH_FLUSH_CHECK_SECS") {
            config.flush_check_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse("RATEMESH_RETENTION_INTERVAL_SECS") {
            config.retention_interval = Duration::from_secs(secs);
        }

        if let Some(days) = env_parse("RATEMESH_RETENTION_RATES_DAYS") {
            config.retention.rates_days = days;
        }
        if let Some(days) = env_parse("RATEMESH_RETENTION_HISTORY_DAYS") {
            config.retention.history_days = days;
        }
        if let Some(days) = env_parse("RATEMESH_RETENTION_STATS_DAYS") {
            config.retention.stats_days = days;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.resolver.validate().map_err(|e| e.to_string())?;
        self.retention.validate().map_err(|e| e.to_string())?;

        if self.cache_backend == CacheBackendKind::Redis && self.redis_url.trim().is_empty() {
            return Err("Redis URL cannot be empty with the redis cache backend".to_string());
        }

        if self.flush_check_interval.is_zero() {
            return Err("Flush check interval cannot be 0".to_string());
        }

        if self.retention_interval.is_zero() {
            return Err("Retention interval cannot be 0".to_string());
        }

        Ok(())
    }

    /// Providers file contents, empty when none is configured.
    pub fn load_providers(&self) -> Result<ProvidersFile, String> {
        match &self.providers_file {
            Some(path) => ProvidersFile::load(path),
            None => Ok(ProvidersFile::default()),
        }
    }
}
