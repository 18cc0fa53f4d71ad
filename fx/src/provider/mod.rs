//! Rate provider trait, descriptors and the provider registry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use ratemesh_common::CurrencyCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RateResult;
use crate::graph::is_usable_rate;

pub mod manual;
pub mod plugin;
pub mod rest;

#[cfg(test)]
pub mod mock;

pub use manual::{ManualRateProvider, MANUAL_PROVIDER_ID, MANUAL_PROVIDER_PRIORITY};
pub use plugin::{PluginProviderConfig, PluginRateProvider, PluginRegistry, RatePlugin};
pub use rest::{RestProviderConfig, RestRateProvider};

/// Rates quoted against one base currency.
pub type RateBatch = HashMap<CurrencyCode, f64>;

/// Two-level rate table: `base -> target -> rate`.
pub type RateTable = HashMap<CurrencyCode, HashMap<CurrencyCode, f64>>;

/// Static description of a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub name: String,
    /// Currencies the provider can quote. Empty means unrestricted.
    #[serde(default)]
    pub supported_currencies: BTreeSet<CurrencyCode>,
    /// Lower is tried first.
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            supported_currencies: BTreeSet::new(),
            priority,
            enabled: true,
        }
    }

    pub fn with_currencies(mut self, codes: impl IntoIterator<Item = CurrencyCode>) -> Self {
        self.supported_currencies = codes.into_iter().collect();
        self
    }

    /// Whether the provider can quote this currency.
    pub fn supports(&self, code: &CurrencyCode) -> bool {
        self.supported_currencies.is_empty() || self.supported_currencies.contains(code)
    }
}

/// A source of exchange rates.
#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Describe the provider.
    fn descriptor(&self) -> ProviderDescriptor;

    /// Provider id.
    fn id(&self) -> String {
        self.descriptor().id
    }

    /// Fetch rates for `base` against `targets` (all available when empty).
    ///
    /// Returns only currencies the provider supports and could resolve;
    /// unsupported targets are omitted, never reported as errors.
    async fn fetch_rates(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch>;

    /// Fetch a single rate for a past date.
    async fn fetch_historical_rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> RateResult<Option<f64>> {
        let targets = BTreeSet::from([to.clone()]);
        let batch = self.fetch_rates(from, &targets, Some(date)).await?;
        Ok(batch.get(to).copied())
    }

    /// Check that the provider is reachable.
    async fn test_connection(&self) -> RateResult<()> {
        Ok(())
    }
}

/// Keep requested, supported, usable quotes; drop the base itself.
pub(crate) fn filter_batch(
    raw: impl IntoIterator<Item = (CurrencyCode, f64)>,
    base: &CurrencyCode,
    targets: &BTreeSet<CurrencyCode>,
    descriptor: &ProviderDescriptor,
) -> RateBatch {
    raw.into_iter()
        .filter(|(code, rate)| {
            code != base
                && (targets.is_empty() || targets.contains(code))
                && descriptor.supports(code)
                && is_usable_rate(*rate)
        })
        .collect()
}

/// Quotes for `base` from a two-level table, using inverted entries
/// (`target -> base`) where no direct quote exists.
pub(crate) fn lookup_quotes(
    table: &RateTable,
    base: &CurrencyCode,
    targets: &BTreeSet<CurrencyCode>,
) -> Vec<(CurrencyCode, f64)> {
    let mut quotes: BTreeMap<CurrencyCode, f64> = BTreeMap::new();

    for (quoted_base, row) in table {
        if quoted_base == base {
            continue;
        }
        if let Some(&rate) = row.get(base) {
            if is_usable_rate(rate) {
                quotes.insert(quoted_base.clone(), 1.0 / rate);
            }
        }
    }

    if let Some(row) = table.get(base) {
        for (target, &rate) in row {
            quotes.insert(target.clone(), rate);
        }
    }

    quotes
        .into_iter()
        .filter(|(code, _)| targets.is_empty() || targets.contains(code))
        .collect()
}

#[derive(Clone)]
struct RegisteredProvider {
    provider: Arc<dyn RateProvider>,
    priority: i32,
    enabled: bool,
}

/// Configured providers, ordered by priority.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<BTreeMap<String, RegisteredProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a provider under its descriptor id.
    pub fn register(&self, provider: Arc<dyn RateProvider>) {
        let descriptor = provider.descriptor();
        info!(
            provider = %descriptor.id,
            priority = descriptor.priority,
            enabled = descriptor.enabled,
            "Registered rate provider"
        );

        self.providers.write().insert(
            descriptor.id,
            RegisteredProvider {
                provider,
                priority: descriptor.priority,
                enabled: descriptor.enabled,
            },
        );
    }

    /// Remove a provider. Returns whether it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.providers.write().remove(id).is_some()
    }

    /// Enable or disable a provider. Returns whether it exists.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.providers.write().get_mut(id) {
            Some(entry) => {
                entry.enabled = enabled;
                debug!(provider = id, enabled, "Provider toggled");
                true
            }
            None => false,
        }
    }

    /// Change a provider's priority. Returns whether it exists.
    pub fn set_priority(&self, id: &str, priority: i32) -> bool {
        match self.providers.write().get_mut(id) {
            Some(entry) => {
                entry.priority = priority;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RateProvider>> {
        self.providers.read().get(id).map(|e| e.provider.clone())
    }

    /// Enabled providers in ascending priority, ties broken by id.
    pub fn ordered(&self) -> Vec<Arc<dyn RateProvider>> {
        let providers = self.providers.read();
        let mut enabled: Vec<(&String, &RegisteredProvider)> =
            providers.iter().filter(|(_, e)| e.enabled).collect();
        enabled.sort_by(|(a_id, a), (b_id, b)| {
            a.priority.cmp(&b.priority).then_with(|| a_id.cmp(b_id))
        });
        enabled.into_iter().map(|(_, e)| e.provider.clone()).collect()
    }

    /// Descriptors reflecting current priority and enabled state.
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .read()
            .values()
            .map(|e| {
                let mut descriptor = e.provider.descriptor();
                descriptor.priority = e.priority;
                descriptor.enabled = e.enabled;
                descriptor
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}
