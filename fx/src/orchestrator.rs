//! Per-request rate resolution.
//!
//! A request for `(from, to, date)` is answered from the cache when possible.
//! On a miss, enabled providers are tried in priority order with the manual
//! provider last; the first non-empty batch wins, is persisted to the store
//! and the cache, and is turned into a rate graph for path finding. When the
//! winning batch cannot reach `to`, the same provider is asked for a
//! `to`-based batch and both graphs are merged, which is how cross rates are
//! inferred through a shared base. Every resolved query leaves an immutable
//! history record and a monitor sample.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use ratemesh_common::{
    constants, effective_date, now, CurrencyCode, DurationExt, RequestContext, Timestamp,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::audit::audited;
use crate::cache::{CacheBackend, CacheEntry, CacheStats, RateCache, RateCacheConfig, RateKey};
use crate::conversion::ConversionResult;
use crate::error::{RateError, RateResult};
use crate::graph::{
    build_graph_at, find_all_paths, find_best_path, merge_graphs, PathResult, RateEdge, RateGraph,
    DEFAULT_MAX_HOPS, DEFAULT_MAX_PATHS,
};
use crate::monitor::{MonitorStats, QueryOutcome, RateMonitor};
use crate::provider::{
    ManualRateProvider, ProviderDescriptor, ProviderRegistry, RateBatch, RateProvider,
};
use crate::store::{history_record, RateHistoryRecord, RateStore, StoredRate};

/// Provider id reported for same-currency requests.
pub const IDENTITY_PROVIDER_ID: &str = "identity";

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Hop bound for path finding.
    pub max_hops: usize,
    /// Alternatives returned by [`RateFetchOrchestrator::find_paths`].
    pub max_paths: usize,
    /// Per-provider call timeout.
    pub provider_timeout: Duration,
    /// Whether to read the cache before calling providers.
    pub use_cache: bool,
    pub cache: RateCacheConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            max_paths: DEFAULT_MAX_PATHS,
            provider_timeout: constants::provider_timeout().as_std(),
            use_cache: true,
            cache: RateCacheConfig::default(),
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> RateResult<()> {
        if self.max_hops == 0 {
            return Err(RateError::Configuration("max_hops must be at least 1".into()));
        }
        if self.max_paths == 0 {
            return Err(RateError::Configuration("max_paths must be at least 1".into()));
        }
        if self.provider_timeout.is_zero() {
            return Err(RateError::Configuration("provider_timeout must be positive".into()));
        }
        if self.cache.ttl <= self.cache.jitter {
            return Err(RateError::Configuration("cache ttl must exceed its jitter".into()));
        }
        Ok(())
    }
}

/// A resolved rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateQuoteResult {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    /// Day the rate applies to.
    pub date: NaiveDate,
    pub rate: f64,
    pub provider_id: String,
    /// When the underlying quote was obtained.
    pub timestamp: Timestamp,
    pub is_inferred: bool,
    pub path: Vec<CurrencyCode>,
    pub hops: usize,
}

impl RateQuoteResult {
    fn identity(code: &CurrencyCode, date: NaiveDate) -> Self {
        Self {
            from: code.clone(),
            to: code.clone(),
            date,
            rate: 1.0,
            provider_id: IDENTITY_PROVIDER_ID.to_string(),
            timestamp: now(),
            is_inferred: false,
            path: vec![code.clone()],
            hops: 0,
        }
    }

    fn from_cache(key: &RateKey, entry: CacheEntry) -> Self {
        Self {
            from: key.from.clone(),
            to: key.to.clone(),
            date: key.date,
            rate: entry.rate,
            provider_id: entry.provider_id,
            timestamp: entry.fetched_at,
            is_inferred: false,
            path: vec![key.from.clone(), key.to.clone()],
            hops: 1,
        }
    }

    fn from_path(key: &RateKey, provider_id: &str, path: PathResult) -> Self {
        let timestamp = path
            .edges_used
            .iter()
            .map(|e| e.observed_at)
            .min()
            .unwrap_or_else(now);

        Self {
            from: key.from.clone(),
            to: key.to.clone(),
            date: key.date,
            rate: path.total_rate,
            provider_id: provider_id.to_string(),
            timestamp,
            is_inferred: path.is_inferred(),
            path: path.path,
            hops: path.hops,
        }
    }
}

/// One request in a batch lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRequest {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub as_of: Option<NaiveDate>,
}

impl RateRequest {
    pub fn new(from: CurrencyCode, to: CurrencyCode, as_of: Option<NaiveDate>) -> Self {
        Self { from, to, as_of }
    }
}

/// Result of an on-demand refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub base: CurrencyCode,
    pub date: NaiveDate,
    pub provider_id: String,
    pub rates: usize,
}

/// Health of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub descriptor: ProviderDescriptor,
    pub healthy: bool,
    pub error: Option<String>,
    pub latency_ms: f64,
}

/// The provider whose batch answered a sweep.
struct Winner {
    provider: Arc<dyn RateProvider>,
    provider_id: String,
    batch: RateBatch,
    fetched_at: Timestamp,
}

impl Winner {
    /// Graph of the winning batch quoted against `base`.
    fn graph(&self, base: &CurrencyCode) -> RateGraph {
        build_graph_at(&self.batch, base, &self.provider_id, self.fetched_at)
    }
}

/// Result of trying providers in order.
struct Sweep {
    winner: Option<Winner>,
    failures: usize,
}

/// Coordinates cache, providers, store, graph engine and monitor.
pub struct RateFetchOrchestrator {
    config: ResolverConfig,
    registry: Arc<ProviderRegistry>,
    manual: Arc<ManualRateProvider>,
    cache: RateCache,
    store: Arc<dyn RateStore>,
    monitor: Arc<RateMonitor>,
}

impl RateFetchOrchestrator {
    /// Create an orchestrator using the process-wide manual provider.
    pub fn new(
        config: ResolverConfig,
        registry: Arc<ProviderRegistry>,
        cache_backend: Arc<dyn CacheBackend>,
        store: Arc<dyn RateStore>,
    ) -> Self {
        let monitor = Arc::new(RateMonitor::new(store.clone()));
        Self {
            cache: RateCache::with_config(cache_backend, config.cache.clone()),
            config,
            registry,
            manual: ManualRateProvider::global(),
            store,
            monitor,
        }
    }

    /// Use a specific manual provider instead of the global one.
    pub fn with_manual_provider(mut self, manual: Arc<ManualRateProvider>) -> Self {
        self.manual = manual;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<RateMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn RateStore> {
        &self.store
    }

    /// Resolve the best rate from `from` to `to`.
    pub async fn resolve_rate(
        &self,
        from: impl AsRef<str>,
        to: impl AsRef<str>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateQuoteResult> {
        let from = CurrencyCode::parse(from.as_ref())?;
        let to = CurrencyCode::parse(to.as_ref())?;
        self.resolve(&from, &to, as_of, self.config.use_cache, None).await
    }

    /// Resolve without reading the cache.
    pub async fn resolve_rate_uncached(
        &self,
        from: impl AsRef<str>,
        to: impl AsRef<str>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateQuoteResult> {
        let from = CurrencyCode::parse(from.as_ref())?;
        let to = CurrencyCode::parse(to.as_ref())?;
        self.resolve(&from, &to, as_of, false, None).await
    }

    /// Convert `amount` of `from` into `to`.
    pub async fn convert(
        &self,
        amount: f64,
        from: impl AsRef<str>,
        to: impl AsRef<str>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<ConversionResult> {
        self.convert_inner(amount, from.as_ref(), to.as_ref(), as_of, None).await
    }

    /// [`resolve_rate`](Self::resolve_rate) on behalf of a caller.
    pub async fn resolve_rate_for(
        &self,
        ctx: &RequestContext,
        from: impl AsRef<str>,
        to: impl AsRef<str>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateQuoteResult> {
        audited(ctx, "resolve_rate", async {
            let from = CurrencyCode::parse(from.as_ref())?;
            let to = CurrencyCode::parse(to.as_ref())?;
            self.resolve(&from, &to, as_of, self.config.use_cache, Some(ctx)).await
        })
        .await
    }

    /// [`convert`](Self::convert) on behalf of a caller.
    pub async fn convert_for(
        &self,
        ctx: &RequestContext,
        amount: f64,
        from: impl AsRef<str>,
        to: impl AsRef<str>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<ConversionResult> {
        let inner = self.convert_inner(amount, from.as_ref(), to.as_ref(), as_of, Some(ctx));
        audited(ctx, "convert", inner).await
    }

    async fn convert_inner(
        &self,
        amount: f64,
        from: &str,
        to: &str,
        as_of: Option<NaiveDate>,
        ctx: Option<&RequestContext>,
    ) -> RateResult<ConversionResult> {
        let from = CurrencyCode::parse(from)?;
        let to = CurrencyCode::parse(to)?;
        crate::conversion::validate_amount(amount)?;

        let quote = self.resolve(&from, &to, as_of, self.config.use_cache, ctx).await?;
        let result = ConversionResult::from_quote(amount, &quote)?;

        info!(
            conversion_id = %result.id,
            from = %result.from,
            to = %result.to,
            converted = %result.converted_amount,
            inferred = result.is_inferred,
            "Conversion completed"
        );
        Ok(result)
    }

    #[instrument(skip_all, fields(from = %from, to = %to))]
    async fn resolve(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        as_of: Option<NaiveDate>,
        use_cache: bool,
        ctx: Option<&RequestContext>,
    ) -> RateResult<RateQuoteResult> {
        let started = Instant::now();
        let date = effective_date(as_of);

        if from == to {
            return Ok(RateQuoteResult::identity(from, date));
        }

        let key = RateKey::new(from.clone(), to.clone(), date);
        if use_cache {
            if let Some(entry) = self.cache.get(&key).await {
                self.monitor.record_query(QueryOutcome::cache_hit(elapsed_ms(started)));
                return Ok(RateQuoteResult::from_cache(&key, entry));
            }
        }

        let sweep = self.sweep(from, &BTreeSet::new(), as_of).await;
        let Some(winner) = sweep.winner else {
            self.record_miss(started, sweep.failures, false);
            warn!(failures = sweep.failures, "All providers failed");
            return Err(RateError::AllProvidersFailed {
                from: from.clone(),
                to: to.clone(),
            });
        };
        self.persist_batch(from, date, &winner).await;

        let mut graph = winner.graph(from);
        let path = match self.path_with_fallback(&key, as_of, &winner, &mut graph).await {
            Some(path) => path,
            None => {
                self.record_miss(started, sweep.failures, false);
                return Err(RateError::RateNotFound {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        };

        self.finish(&key, &winner.provider_id, path, ctx, started, sweep.failures).await
    }

    /// Resolve many requests, sharing provider calls between requests with
    /// the same base and date. Results are aligned with `requests`.
    #[instrument(skip_all, fields(count = requests.len()))]
    pub async fn get_rates_batch(
        &self,
        requests: &[RateRequest],
    ) -> Vec<RateResult<RateQuoteResult>> {
        let mut results: Vec<Option<RateResult<RateQuoteResult>>> =
            (0..requests.len()).map(|_| None).collect();

        let mut by_date: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
        for (i, request) in requests.iter().enumerate() {
            let date = effective_date(request.as_of);
            if request.from == request.to {
                results[i] = Some(Ok(RateQuoteResult::identity(&request.from, date)));
            } else {
                by_date.entry(date).or_default().push(i);
            }
        }

        for (date, indices) in by_date {
            let started = Instant::now();
            let as_of = Some(date);
            let keys: Vec<RateKey> = indices
                .iter()
                .map(|&i| RateKey::new(requests[i].from.clone(), requests[i].to.clone(), date))
                .collect();

            let cached = if self.config.use_cache {
                self.cache.get_batch(&keys).await
            } else {
                vec![None; keys.len()]
            };

            let mut misses_by_base: BTreeMap<CurrencyCode, Vec<(usize, RateKey)>> =
                BTreeMap::new();
            for ((&i, key), entry) in indices.iter().zip(keys).zip(cached) {
                match entry {
                    Some(entry) => {
                        self.monitor.record_query(QueryOutcome::cache_hit(elapsed_ms(started)));
                        results[i] = Some(Ok(RateQuoteResult::from_cache(&key, entry)));
                    }
                    None => misses_by_base.entry(key.from.clone()).or_default().push((i, key)),
                }
            }

            for (base, pending) in misses_by_base {
                let started = Instant::now();
                let sweep = self.sweep(&base, &BTreeSet::new(), as_of).await;

                let Some(winner) = sweep.winner else {
                    for (i, key) in pending {
                        self.record_miss(started, sweep.failures, false);
                        results[i] = Some(Err(RateError::AllProvidersFailed {
                            from: key.from,
                            to: key.to,
                        }));
                    }
                    continue;
                };
                self.persist_batch(&base, date, &winner).await;

                let mut graph = winner.graph(&base);
                for (i, key) in pending {
                    let found = self.path_with_fallback(&key, as_of, &winner, &mut graph).await;
                    let failures = sweep.failures;
                    let outcome = match found {
                        Some(path) => {
                            self.finish(&key, &winner.provider_id, path, None, started, failures)
                                .await
                        }
                        None => {
                            self.record_miss(started, sweep.failures, false);
                            Err(RateError::RateNotFound { from: key.from, to: key.to })
                        }
                    };
                    results[i] = Some(outcome);
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(RateError::Configuration("request left unresolved".into()))
                })
            })
            .collect()
    }

    /// Alternative conversion paths, best rate first.
    #[instrument(skip_all, fields(from = %from.as_ref(), to = %to.as_ref()))]
    pub async fn find_paths(
        &self,
        from: impl AsRef<str>,
        to: impl AsRef<str>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<Vec<PathResult>> {
        let from = CurrencyCode::parse(from.as_ref())?;
        let to = CurrencyCode::parse(to.as_ref())?;
        if from == to {
            return Ok(vec![PathResult::identity(&from)]);
        }

        let sweep = self.sweep(&from, &BTreeSet::new(), as_of).await;
        let winner = sweep.winner.ok_or_else(|| RateError::AllProvidersFailed {
            from: from.clone(),
            to: to.clone(),
        })?;

        let mut graph = winner.graph(&from);
        if let Some(extra) = self.counter_graph(&winner, &to, as_of).await {
            graph = merge_graphs([graph, extra]);
        }

        Ok(find_all_paths(
            &graph,
            &from,
            &to,
            self.config.max_paths,
            self.config.max_hops,
        ))
    }

    /// Fetch a batch for `base` and warm the store and cache with it.
    #[instrument(skip_all, fields(base = %base.as_ref()))]
    pub async fn refresh_base(
        &self,
        base: impl AsRef<str>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RefreshReport> {
        let base = CurrencyCode::parse(base.as_ref())?;
        let date = effective_date(as_of);

        let sweep = self.sweep(&base, &BTreeSet::new(), as_of).await;
        let winner = sweep.winner.ok_or_else(|| RateError::AllProvidersFailed {
            from: base.clone(),
            to: base.clone(),
        })?;
        self.persist_batch(&base, date, &winner).await;

        info!(
            provider = %winner.provider_id,
            rates = winner.batch.len(),
            "Refreshed base currency"
        );
        Ok(RefreshReport {
            base,
            date,
            provider_id: winner.provider_id,
            rates: winner.batch.len(),
        })
    }

    /// Enter a manual rate and drop today's cached entries for the pair.
    pub async fn set_manual_rate(
        &self,
        base: impl AsRef<str>,
        target: impl AsRef<str>,
        rate: f64,
    ) -> RateResult<()> {
        let base = CurrencyCode::parse(base.as_ref())?;
        let target = CurrencyCode::parse(target.as_ref())?;
        self.manual.set_rate(base.clone(), target.clone(), rate)?;

        let date = effective_date(None);
        self.cache.delete(&RateKey::new(base.clone(), target.clone(), date)).await;
        self.cache.delete(&RateKey::new(target, base, date)).await;
        Ok(())
    }

    /// Run `test_connection` on every configured provider and the manual one.
    pub async fn check_providers(&self) -> Vec<ProviderHealth> {
        let mut checks: Vec<(ProviderDescriptor, Arc<dyn RateProvider>)> = self
            .registry
            .descriptors()
            .into_iter()
            .filter_map(|d| self.registry.get(&d.id).map(|p| (d, p)))
            .collect();
        let manual: Arc<dyn RateProvider> = self.manual.clone();
        checks.push((manual.descriptor(), manual));

        let mut report = Vec::with_capacity(checks.len());
        for (descriptor, provider) in checks {
            let started = Instant::now();
            let check =
                tokio::time::timeout(self.config.provider_timeout, provider.test_connection());
            let outcome = match check.await {
                Ok(result) => result,
                Err(_) => Err(self.timeout_error(&descriptor.id)),
            };

            if let Err(e) = &outcome {
                warn!(provider = %descriptor.id, error = %e, "Provider health check failed");
            }
            report.push(ProviderHealth {
                healthy: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
                latency_ms: elapsed_ms(started),
                descriptor,
            });
        }
        report
    }

    /// Recorded history for a pair, newest first.
    pub async fn history(
        &self,
        from: impl AsRef<str>,
        to: impl AsRef<str>,
        limit: usize,
    ) -> RateResult<Vec<RateHistoryRecord>> {
        let from = CurrencyCode::parse(from.as_ref())?;
        let to = CurrencyCode::parse(to.as_ref())?;
        self.store.history(&from, &to, limit).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub fn current_stats(&self) -> MonitorStats {
        self.monitor.get_current_stats()
    }

    /// Try providers in order, manual last. The first non-empty batch wins.
    async fn sweep(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        as_of: Option<NaiveDate>,
    ) -> Sweep {
        let mut providers = self.registry.ordered();
        providers.push(self.manual.clone());

        let mut failures = 0;
        for provider in providers {
            let provider_id = provider.id();
            match self.fetch_from(&provider, base, targets, as_of).await {
                Ok(batch) if !batch.is_empty() => {
                    debug!(provider = %provider_id, rates = batch.len(), "Provider answered");
                    return Sweep {
                        winner: Some(Winner {
                            provider,
                            provider_id,
                            batch,
                            fetched_at: now(),
                        }),
                        failures,
                    };
                }
                Ok(_) => {
                    debug!(provider = %provider_id, base = %base, "Provider returned no rates")
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        provider = %provider_id,
                        base = %base,
                        error = %e,
                        "Provider failed, trying next"
                    );
                }
            }
        }

        Sweep { winner: None, failures }
    }

    async fn fetch_from(
        &self,
        provider: &Arc<dyn RateProvider>,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch> {
        let fetch = provider.fetch_rates(base, targets, as_of);
        match tokio::time::timeout(self.config.provider_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(&provider.id())),
        }
    }

    fn timeout_error(&self, provider: &str) -> RateError {
        RateError::ProviderTimeout {
            provider: provider.to_string(),
            timeout_ms: self.config.provider_timeout.as_millis().min(u64::MAX as u128) as u64,
        }
    }

    /// Upsert the batch into the store and cache. Store failures are logged.
    async fn persist_batch(&self, base: &CurrencyCode, date: NaiveDate, winner: &Winner) {
        let rows: Vec<StoredRate> = winner
            .batch
            .iter()
            .map(|(target, &rate)| StoredRate {
                from: base.clone(),
                to: target.clone(),
                date,
                rate,
                provider_id: winner.provider_id.clone(),
                fetched_at: winner.fetched_at,
            })
            .collect();

        if let Err(e) = self.store.upsert_rates(&rows).await {
            warn!(store = self.store.name(), error = %e, "Rate upsert failed, continuing");
        }

        let entries: Vec<(RateKey, f64)> =
            rows.into_iter().map(|row| (row.key(), row.rate)).collect();
        self.cache.set_batch(&entries, &winner.provider_id).await;
    }

    /// Best path in `graph`, widening it with a `to`-based batch from the
    /// same provider when needed, then falling back to a direct quote.
    async fn path_with_fallback(
        &self,
        key: &RateKey,
        as_of: Option<NaiveDate>,
        winner: &Winner,
        graph: &mut RateGraph,
    ) -> Option<PathResult> {
        let max_hops = self.config.max_hops;
        if let Some(path) = find_best_path(graph, &key.from, &key.to, max_hops) {
            return Some(path);
        }

        if !graph.contains(&key.to) {
            if let Some(extra) = self.counter_graph(winner, &key.to, as_of).await {
                *graph = merge_graphs([std::mem::take(graph), extra]);
                if let Some(path) = find_best_path(graph, &key.from, &key.to, max_hops) {
                    return Some(path);
                }
            }
        }

        let rate = winner.batch.get(&key.to).copied()?;
        debug!(from = %key.from, to = %key.to, "No path within hop bound, using direct quote");
        Some(PathResult {
            path: vec![key.from.clone(), key.to.clone()],
            total_rate: rate,
            hops: 1,
            edges_used: vec![RateEdge {
                from: key.from.clone(),
                to: key.to.clone(),
                rate,
                provider_id: winner.provider_id.clone(),
                observed_at: winner.fetched_at,
            }],
        })
    }

    /// Graph of the winning provider's rates quoted against `to`.
    async fn counter_graph(
        &self,
        winner: &Winner,
        to: &CurrencyCode,
        as_of: Option<NaiveDate>,
    ) -> Option<RateGraph> {
        match self.fetch_from(&winner.provider, to, &BTreeSet::new(), as_of).await {
            Ok(batch) if !batch.is_empty() => {
                debug!(
                    provider = %winner.provider_id,
                    base = %to,
                    rates = batch.len(),
                    "Fetched counter-currency batch"
                );
                Some(build_graph_at(&batch, to, &winner.provider_id, now()))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(
                    provider = %winner.provider_id,
                    base = %to,
                    error = %e,
                    "Counter-currency fetch failed"
                );
                None
            }
        }
    }

    /// Append history and record the outcome of a provider-resolved query.
    async fn finish(
        &self,
        key: &RateKey,
        provider_id: &str,
        path: PathResult,
        ctx: Option<&RequestContext>,
        started: Instant,
        failures: usize,
    ) -> RateResult<RateQuoteResult> {
        let quote = RateQuoteResult::from_path(key, provider_id, path);
        let record = history_record(
            &quote.from,
            &quote.to,
            quote.date,
            quote.rate,
            provider_id,
            quote.path.clone(),
            ctx.map(|c| c.correlation_id.to_string()),
        );

        let appended = self.store.append_history(&record).await;
        self.record_miss(started, failures, quote.is_inferred);

        if let Err(e) = appended {
            warn!(from = %quote.from, to = %quote.to, error = %e, "Rate history write failed");
            return Err(match e {
                RateError::HistoryWriteFailed(_) => e,
                other => RateError::HistoryWriteFailed(other.to_string()),
            });
        }

        info!(
            from = %quote.from,
            to = %quote.to,
            rate = quote.rate,
            provider = %quote.provider_id,
            hops = quote.hops,
            inferred = quote.is_inferred,
            "Rate resolved"
        );
        Ok(quote)
    }

    fn record_miss(&self, started: Instant, failures: usize, inferred: bool) {
        self.monitor.record_query(QueryOutcome {
            cache_hit: false,
            provider_called: true,
            provider_failed: failures > 0,
            inferred,
            latency_ms: elapsed_ms(started),
        });
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
