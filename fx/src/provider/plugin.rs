//! Plugin providers: conversion logic supplied outside the engine.
//!
//! Plugins implement [`RatePlugin`] and are built by name from a
//! [`PluginRegistry`]. Two kinds ship with the engine: `static` (a rate
//! table held in configuration) and `command` (an external program spoken
//! to over stdin/stdout with a fixed JSON schema). A
//! [`PluginRateProvider`] can be reloaded with new settings while the
//! process keeps running.

use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use ratemesh_common::CurrencyCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use super::{filter_batch, lookup_quotes, ProviderDescriptor, RateBatch, RateProvider, RateTable};
use crate::error::{RateError, RateResult};

/// Conversion logic behind a plugin provider.
#[async_trait]
pub trait RatePlugin: Send + Sync {
    /// Plugin kind, as registered.
    fn kind(&self) -> &str;

    /// Rates for `base` against `targets` (all available when empty).
    async fn rates(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch>;

    async fn health_check(&self) -> RateResult<()> {
        Ok(())
    }
}

/// Builds a plugin from its settings.
pub type PluginFactory = Arc<dyn Fn(&Value) -> RateResult<Arc<dyn RatePlugin>> + Send + Sync>;

/// Named plugin factories available to the process.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `static` and `command` kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(StaticTablePlugin::KIND, |settings| {
            Ok(Arc::new(StaticTablePlugin::from_settings(settings)?) as Arc<dyn RatePlugin>)
        });
        registry.register(CommandPlugin::KIND, |settings| {
            Ok(Arc::new(CommandPlugin::from_settings(settings)?) as Arc<dyn RatePlugin>)
        });
        registry
    }

    /// Register a factory under `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&Value) -> RateResult<Arc<dyn RatePlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    /// Build a plugin of `kind`.
    pub fn build(&self, kind: &str, settings: &Value) -> RateResult<Arc<dyn RatePlugin>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| RateError::Plugin(format!("Unknown plugin kind {:?}", kind)))?;
        factory(settings)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Serialized configuration of a plugin provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginProviderConfig {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    /// Registered plugin kind.
    pub plugin: String,
    #[serde(default)]
    pub settings: Value,
}

struct LoadedPlugin {
    kind: String,
    settings: Value,
    plugin: Arc<dyn RatePlugin>,
    generation: u64,
}

/// Provider delegating to a reloadable plugin.
pub struct PluginRateProvider {
    descriptor: ProviderDescriptor,
    registry: Arc<PluginRegistry>,
    loaded: RwLock<LoadedPlugin>,
}

impl PluginRateProvider {
    /// Build the configured plugin.
    pub fn new(config: PluginProviderConfig, registry: Arc<PluginRegistry>) -> RateResult<Self> {
        let plugin = registry.build(&config.plugin, &config.settings)?;

        Ok(Self {
            descriptor: config.descriptor,
            registry,
            loaded: RwLock::new(LoadedPlugin {
                kind: config.plugin,
                settings: config.settings,
                plugin,
                generation: 1,
            }),
        })
    }

    /// Rebuild the plugin from new settings and swap it in.
    ///
    /// On failure the previous plugin stays active.
    pub fn reload(&self, settings: Value) -> RateResult<()> {
        let kind = self.loaded.read().kind.clone();
        self.reload_as(&kind, settings)
    }

    /// Like [`reload`](Self::reload) but may also change the plugin kind.
    pub fn reload_as(&self, kind: &str, settings: Value) -> RateResult<()> {
        let plugin = match self.registry.build(kind, &settings) {
            Ok(plugin) => plugin,
            Err(e) => {
                warn!(
                    provider = %self.descriptor.id,
                    kind,
                    error = %e,
                    "Plugin reload failed, keeping previous"
                );
                return Err(e);
            }
        };

        let mut loaded = self.loaded.write();
        loaded.kind = kind.to_string();
        loaded.settings = settings;
        loaded.plugin = plugin;
        loaded.generation += 1;

        info!(
            provider = %self.descriptor.id,
            kind,
            generation = loaded.generation,
            "Plugin reloaded"
        );
        Ok(())
    }

    /// Incremented on every successful (re)load.
    pub fn generation(&self) -> u64 {
        self.loaded.read().generation
    }

    pub fn settings(&self) -> Value {
        self.loaded.read().settings.clone()
    }

    fn current(&self) -> Arc<dyn RatePlugin> {
        self.loaded.read().plugin.clone()
    }
}

#[async_trait]
impl RateProvider for PluginRateProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        self.descriptor.clone()
    }

    async fn fetch_rates(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch> {
        let plugin = self.current();
        let raw = plugin.rates(base, targets, as_of).await?;
        Ok(filter_batch(raw, base, targets, &self.descriptor))
    }

    async fn test_connection(&self) -> RateResult<()> {
        self.current().health_check().await
    }
}

/// Rates held directly in the plugin settings:
/// `{"rates": {"USD": {"EUR": 0.92}}}`.
pub struct StaticTablePlugin {
    table: RateTable,
}

#[derive(Deserialize)]
struct StaticSettings {
    rates: HashMap<CurrencyCode, HashMap<CurrencyCode, f64>>,
}

impl StaticTablePlugin {
    pub const KIND: &'static str = "static";

    pub fn from_settings(settings: &Value) -> RateResult<Self> {
        let parsed: StaticSettings = serde_json::from_value(settings.clone())
            .map_err(|e| RateError::Plugin(format!("static plugin settings: {}", e)))?;
        Ok(Self { table: parsed.rates })
    }
}

#[async_trait]
impl RatePlugin for StaticTablePlugin {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn rates(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        _as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch> {
        Ok(lookup_quotes(&self.table, base, targets).into_iter().collect())
    }
}

/// Request written to a command plugin's stdin.
#[derive(Debug, Serialize)]
pub struct CommandRequest<'a> {
    pub base: &'a CurrencyCode,
    pub targets: Vec<&'a CurrencyCode>,
    pub as_of: Option<NaiveDate>,
}

/// Response read from a command plugin's stdout.
#[derive(Debug, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub rates: HashMap<String, f64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommandSettings {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_command_timeout_secs")]
    timeout_secs: u64,
}

fn default_command_timeout_secs() -> u64 {
    10
}

/// Runs an external program per request, isolated in its own process.
pub struct CommandPlugin {
    settings: CommandSettings,
}

impl CommandPlugin {
    pub const KIND: &'static str = "command";

    pub fn from_settings(settings: &Value) -> RateResult<Self> {
        let settings: CommandSettings = serde_json::from_value(settings.clone())
            .map_err(|e| RateError::Plugin(format!("command plugin settings: {}", e)))?;
        if settings.program.trim().is_empty() {
            return Err(RateError::Plugin("command plugin needs a program".into()));
        }
        Ok(Self { settings })
    }

    async fn run(&self, input: Vec<u8>) -> RateResult<Vec<u8>> {
        let mut child = Command::new(&self.settings.program)
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RateError::Plugin(format!("spawn {}: {}", self.settings.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| RateError::Plugin(format!("write request: {}", e)))?;
        }

        let timeout = Duration::from_secs(self.settings.timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                RateError::Plugin(format!(
                    "{} timed out after {:?}",
                    self.settings.program, timeout
                ))
            })?
            .map_err(|e| RateError::Plugin(format!("wait: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RateError::Plugin(format!(
                "{} exited with {}: {}",
                self.settings.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl RatePlugin for CommandPlugin {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn rates(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch> {
        let request = CommandRequest {
            base,
            targets: targets.iter().collect(),
            as_of,
        };
        let input = serde_json::to_vec(&request).map_err(|e| RateError::Plugin(e.to_string()))?;

        let stdout = self.run(input).await?;
        let response: CommandResponse = serde_json::from_slice(&stdout)
            .map_err(|e| RateError::Plugin(format!("malformed plugin response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(RateError::Plugin(error));
        }

        Ok(response
            .rates
            .into_iter()
            .filter_map(|(code, rate)| CurrencyCode::parse(&code).ok().map(|c| (c, rate)))
            .collect())
    }
}
