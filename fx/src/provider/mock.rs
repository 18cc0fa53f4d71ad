//! Scripted rate provider for tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use ratemesh_common::CurrencyCode;

use super::{filter_batch, lookup_quotes, ProviderDescriptor, RateBatch, RateProvider, RateTable};
use crate::error::{RateError, RateResult};

#[derive(Debug, Clone)]
enum Behavior {
    Quote,
    Fail,
    Empty,
    Delay(Duration),
}

/// Mock rate provider for testing.
pub struct MockRateProvider {
    descriptor: ProviderDescriptor,
    table: Mutex<RateTable>,
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl MockRateProvider {
    fn new(id: &str, priority: i32, behavior: Behavior) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(id, id, priority),
            table: Mutex::new(RateTable::new()),
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        }
    }

    /// Provider answering from `(base, target, rate)` triples.
    pub fn with_rates(id: &str, priority: i32, rates: &[(&str, &str, f64)]) -> Self {
        let provider = Self::new(id, priority, Behavior::Quote);
        for (base, target, rate) in rates {
            provider.set_rate(base, target, *rate);
        }
        provider
    }

    /// Provider that always errors.
    pub fn failing(id: &str, priority: i32) -> Self {
        Self::new(id, priority, Behavior::Fail)
    }

    /// Provider that always answers with nothing.
    pub fn empty(id: &str, priority: i32) -> Self {
        Self::new(id, priority, Behavior::Empty)
    }

    /// Provider that sleeps before answering from its table.
    pub fn slow(id: &str, priority: i32, delay: Duration, rates: &[(&str, &str, f64)]) -> Self {
        let provider = Self::with_rates(id, priority, rates);
        *provider.behavior.lock() = Behavior::Delay(delay);
        provider
    }

    pub fn set_rate(&self, base: &str, target: &str, rate: f64) {
        self.table
            .lock()
            .entry(CurrencyCode::parse(base).unwrap())
            .or_default()
            .insert(CurrencyCode::parse(target).unwrap(), rate);
    }

    /// Switch to failing on every call.
    pub fn start_failing(&self) {
        *self.behavior.lock() = Behavior::Fail;
    }

    /// Number of `fetch_rates` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateProvider for MockRateProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        self.descriptor.clone()
    }

    async fn fetch_rates(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        _as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Fail => {
                return Err(RateError::provider(&self.descriptor.id, "scripted failure"))
            }
            Behavior::Empty => return Ok(RateBatch::new()),
            Behavior::Delay(delay) => tokio::time::sleep(delay).await,
            Behavior::Quote => {}
        }

        let quotes = lookup_quotes(&self.table.lock(), base, targets);
        Ok(filter_batch(quotes, base, targets, &self.descriptor))
    }
}
