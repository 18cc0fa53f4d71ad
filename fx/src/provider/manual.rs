//! Operator-entered rates, tried after every configured provider.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use ratemesh_common::CurrencyCode;
use tracing::info;

use super::{filter_batch, lookup_quotes, ProviderDescriptor, RateBatch, RateProvider, RateTable};
use crate::error::{RateError, RateResult};
use crate::graph::is_usable_rate;

/// Id reported for manually entered rates.
pub const MANUAL_PROVIDER_ID: &str = "manual";

/// Priority of the manual provider. Always last.
pub const MANUAL_PROVIDER_PRIORITY: i32 = 999;

static GLOBAL: OnceLock<Arc<ManualRateProvider>> = OnceLock::new();

/// In-memory table of manually entered rates.
///
/// Rates are not date-aware: the same table answers every as-of date.
#[derive(Default)]
pub struct ManualRateProvider {
    rates: RwLock<RateTable>,
}

impl ManualRateProvider {
    /// Create an empty, standalone table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance.
    pub fn global() -> Arc<ManualRateProvider> {
        GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Enter or replace the rate `base -> target`.
    pub fn set_rate(&self, base: CurrencyCode, target: CurrencyCode, rate: f64) -> RateResult<()> {
        if base == target {
            return Err(RateError::Configuration(format!(
                "Manual rate must join two different currencies, got {}",
                base
            )));
        }
        if !is_usable_rate(rate) {
            return Err(RateError::Configuration(format!(
                "Manual rate {}/{} must be positive and finite, got {}",
                base, target, rate
            )));
        }

        info!(base = %base, target = %target, rate, "Manual rate set");
        self.rates.write().entry(base).or_default().insert(target, rate);
        Ok(())
    }

    /// Remove the rate `base -> target`. Returns whether it existed.
    pub fn remove_rate(&self, base: &CurrencyCode, target: &CurrencyCode) -> bool {
        let mut rates = self.rates.write();
        let removed = rates
            .get_mut(base)
            .map(|row| row.remove(target).is_some())
            .unwrap_or(false);
        if rates.get(base).is_some_and(|row| row.is_empty()) {
            rates.remove(base);
        }
        removed
    }

    /// Directly entered rate, if any.
    pub fn rate(&self, base: &CurrencyCode, target: &CurrencyCode) -> Option<f64> {
        self.rates.read().get(base).and_then(|row| row.get(target)).copied()
    }

    pub fn clear(&self) {
        self.rates.write().clear();
    }

    /// Number of entered rates.
    pub fn len(&self) -> usize {
        self.rates.read().values().map(|row| row.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn currencies(&self) -> BTreeSet<CurrencyCode> {
        let rates = self.rates.read();
        rates
            .iter()
            .flat_map(|(base, row)| std::iter::once(base.clone()).chain(row.keys().cloned()))
            .collect()
    }
}

#[async_trait]
impl RateProvider for ManualRateProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new(MANUAL_PROVIDER_ID, "Manual rates", MANUAL_PROVIDER_PRIORITY)
            .with_currencies(self.currencies())
    }

    async fn fetch_rates(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        _as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch> {
        let quotes = lookup_quotes(&self.rates.read(), base, targets);
        Ok(filter_batch(quotes, base, targets, &self.descriptor()))
    }
}
