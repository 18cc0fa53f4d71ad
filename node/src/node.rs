//! Node assembly and lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use ratemesh_common::today;
use ratemesh_fx::provider::{
    ManualRateProvider, PluginRateProvider, PluginRegistry, ProviderRegistry, RestRateProvider,
};
use ratemesh_fx::store::run_retention;
use ratemesh_fx::{
    CacheBackend, MemoryCacheBackend, MemoryRateStore, PgRateStore, RateFetchOrchestrator,
    RateProvider, RateStore, RedisCacheBackend, RetentionPolicy,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::{CacheBackendKind, NodeConfig, ProviderConfig, ProvidersFile};
use crate::state::NodeState;

/// A running rate resolution node.
pub struct RateNode {
    config: NodeConfig,
    orchestrator: Arc<RateFetchOrchestrator>,
    plugin_registry: Arc<PluginRegistry>,
    /// Plugin providers by id, for hot reload.
    plugins: RwLock<HashMap<String, Arc<PluginRateProvider>>>,
    state: RwLock<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RateNode {
    /// Connect backends and register configured providers.
    #[instrument(skip_all)]
    pub async fn build(config: NodeConfig) -> Result<Self> {
        let store: Arc<dyn RateStore> = match &config.database_url {
            Some(url) => {
                let store = PgRateStore::connect(url).await.context("connecting rate store")?;
                store.migrate().await.context("migrating rate store")?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set, rate store is in memory");
                Arc::new(MemoryRateStore::new())
            }
        };

        let cache_backend: Arc<dyn CacheBackend> = match config.cache_backend {
            CacheBackendKind::Memory => Arc::new(MemoryCacheBackend::new()),
            CacheBackendKind::Redis => Arc::new(
                RedisCacheBackend::connect(&config.redis_url)
                    .await
                    .context("connecting Redis cache")?,
            ),
        };

        let providers = config.load_providers().map_err(anyhow::Error::msg)?;
        let plugin_registry = Arc::new(PluginRegistry::with_builtins());
        let registry = Arc::new(ProviderRegistry::new());
        let plugins = register_providers(&registry, &plugin_registry, &providers)?;

        let manual = ManualRateProvider::global();
        for entry in &providers.manual_rates {
            manual
                .set_rate(entry.base.parse()?, entry.target.parse()?, entry.rate)
                .with_context(|| format!("manual rate {}/{}", entry.base, entry.target))?;
        }

        let orchestrator =
            RateFetchOrchestrator::new(config.resolver.clone(), registry, cache_backend, store);

        info!(
            providers = providers.providers.len(),
            manual_rates = providers.manual_rates.len(),
            cache = ?config.cache_backend,
            "Rate node assembled"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
            plugin_registry,
            plugins: RwLock::new(plugins),
            state: RwLock::new(NodeState::Starting),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn orchestrator(&self) -> &Arc<RateFetchOrchestrator> {
        &self.orchestrator
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    /// Start the monitor flush and retention loops.
    #[instrument(skip(self))]
    pub fn start(&self) {
        let monitor = self.orchestrator.monitor().clone();
        let flush = tokio::spawn(
            monitor.run_flush_loop(self.config.flush_check_interval, self.shutdown_tx.subscribe()),
        );

        let retention = tokio::spawn(run_retention_loop(
            self.orchestrator.store().clone(),
            self.config.retention,
            self.config.retention_interval,
            self.shutdown_tx.subscribe(),
        ));

        self.tasks.lock().extend([flush, retention]);
        *self.state.write() = NodeState::Running;
        info!("Rate node started");
    }

    /// Stop background loops, waiting for the final statistics flush.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        *self.state.write() = NodeState::ShuttingDown;
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drain = async {
            for task in tasks {
                if let Err(e) = task.await {
                    error!(error = %e, "Background task panicked");
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
            warn!("Timed out waiting for background tasks");
        }

        *self.state.write() = NodeState::Stopped;
        info!("Rate node stopped");
    }

    /// Re-read the providers file and reload every plugin provider in it.
    ///
    /// Returns the number of plugins reloaded. A plugin that fails to
    /// reload keeps running with its previous settings.
    pub async fn reload_plugins(&self) -> Result<usize> {
        let providers = self.config.load_providers().map_err(anyhow::Error::msg)?;
        let plugins = self.plugins.read().clone();

        let mut reloaded = 0;
        for provider in providers.providers {
            let ProviderConfig::Plugin(config) = provider else {
                continue;
            };
            match plugins.get(&config.descriptor.id) {
                Some(plugin) => match plugin.reload_as(&config.plugin, config.settings) {
                    Ok(()) => reloaded += 1,
                    Err(e) => {
                        error!(provider = %config.descriptor.id, error = %e, "Plugin reload failed")
                    }
                },
                None => {
                    let plugin =
                        Arc::new(PluginRateProvider::new(config, self.plugin_registry.clone())?);
                    let id = plugin.id();
                    self.orchestrator.registry().register(plugin.clone());
                    self.plugins.write().insert(id, plugin);
                    reloaded += 1;
                }
            }
        }
        Ok(reloaded)
    }
}

fn register_providers(
    registry: &ProviderRegistry,
    plugin_registry: &Arc<PluginRegistry>,
    providers: &ProvidersFile,
) -> Result<HashMap<String, Arc<PluginRateProvider>>> {
    let mut plugins = HashMap::new();

    for provider in &providers.providers {
        match provider {
            ProviderConfig::Rest(config) => {
                let rest = RestRateProvider::new(config.clone())
                    .with_context(|| format!("provider {}", config.descriptor.id))?;
                registry.register(Arc::new(rest));
            }
            ProviderConfig::Plugin(config) => {
                let plugin = Arc::new(
                    PluginRateProvider::new(config.clone(), plugin_registry.clone())
                        .with_context(|| format!("provider {}", config.descriptor.id))?,
                );
                registry.register(plugin.clone());
                plugins.insert(config.descriptor.id.clone(), plugin);
            }
        }
    }

    Ok(plugins)
}

/// Apply the retention policy every `interval` until shutdown.
pub async fn run_retention_loop(
    store: Arc<dyn RateStore>,
    policy: RetentionPolicy,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_retention(store.as_ref(), &policy, today()).await {
                    warn!(error = %e, "Retention pass failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Retention loop stopped");
}
