//! Rolling query statistics with hourly persistence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ratemesh_common::{now, HourBucket, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{RateError, RateResult};
use crate::store::{HourlyStatsRow, RateStore};

/// Outcome of one rate query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub cache_hit: bool,
    pub provider_called: bool,
    /// At least one provider failed while answering the query.
    pub provider_failed: bool,
    pub inferred: bool,
    pub latency_ms: f64,
}

impl QueryOutcome {
    pub fn cache_hit(latency_ms: f64) -> Self {
        Self {
            cache_hit: true,
            latency_ms,
            ..Default::default()
        }
    }
}

/// Counters accumulated for one hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub bucket: HourBucket,
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub provider_calls: u64,
    pub provider_failures: u64,
    pub inferred_rates: u64,
    pub latency_sum_ms: f64,
}

impl StatsSnapshot {
    pub fn new(bucket: HourBucket) -> Self {
        Self {
            bucket,
            total_queries: 0,
            cache_hits: 0,
            cache_misses: 0,
            provider_calls: 0,
            provider_failures: 0,
            inferred_rates: 0,
            latency_sum_ms: 0.0,
        }
    }

    fn record(&mut self, outcome: &QueryOutcome) {
        self.total_queries += 1;
        if outcome.cache_hit {
            self.cache_hits += 1;
        } else {
            self.cache_misses += 1;
        }
        if outcome.provider_called {
            self.provider_calls += 1;
        }
        if outcome.provider_failed {
            self.provider_failures += 1;
        }
        if outcome.inferred {
            self.inferred_rates += 1;
        }
        self.latency_sum_ms += outcome.latency_ms.max(0.0);
    }

    /// Add another snapshot's counters, keeping this bucket.
    fn absorb(&mut self, other: &StatsSnapshot) {
        self.total_queries += other.total_queries;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.provider_calls += other.provider_calls;
        self.provider_failures += other.provider_failures;
        self.inferred_rates += other.inferred_rates;
        self.latency_sum_ms += other.latency_sum_ms;
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_queries as f64 * 100.0
        }
    }

    /// 100 when no provider was called.
    pub fn provider_success_rate(&self) -> f64 {
        if self.provider_calls == 0 {
            100.0
        } else {
            let succeeded = self.provider_calls.saturating_sub(self.provider_failures);
            succeeded as f64 / self.provider_calls as f64 * 100.0
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.latency_sum_ms / self.total_queries as f64
        }
    }

    fn to_row(&self) -> HourlyStatsRow {
        HourlyStatsRow {
            bucket: self.bucket,
            total_queries: self.total_queries,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            provider_calls: self.provider_calls,
            provider_failures: self.provider_failures,
            inferred_rates: self.inferred_rates,
            cache_hit_rate: self.cache_hit_rate(),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

/// Current-hour counters with derived rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStats {
    #[serde(flatten)]
    pub snapshot: StatsSnapshot,
    pub cache_hit_rate: f64,
    pub provider_success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Accumulates query outcomes and flushes them hourly to the store.
pub struct RateMonitor {
    current: Mutex<StatsSnapshot>,
    store: Arc<dyn RateStore>,
    flushing: AtomicBool,
}

impl RateMonitor {
    pub fn new(store: Arc<dyn RateStore>) -> Self {
        Self::starting_at(store, now())
    }

    /// Monitor whose first snapshot covers the hour of `at`.
    pub fn starting_at(store: Arc<dyn RateStore>, at: Timestamp) -> Self {
        Self {
            current: Mutex::new(StatsSnapshot::new(HourBucket::of(at))),
            store,
            flushing: AtomicBool::new(false),
        }
    }

    pub fn record_query(&self, outcome: QueryOutcome) {
        self.current.lock().record(&outcome);
        debug!(
            cache_hit = outcome.cache_hit,
            provider_failed = outcome.provider_failed,
            inferred = outcome.inferred,
            latency_ms = outcome.latency_ms,
            "Recorded rate query"
        );
    }

    pub fn get_current_stats(&self) -> MonitorStats {
        let snapshot = self.current.lock().clone();
        MonitorStats {
            cache_hit_rate: snapshot.cache_hit_rate(),
            provider_success_rate: snapshot.provider_success_rate(),
            avg_latency_ms: snapshot.avg_latency_ms(),
            snapshot,
        }
    }

    /// Persist the current snapshot and start a new one for the current hour.
    ///
    /// Returns the written row, or `None` when the snapshot was empty or a
    /// flush was already running.
    pub async fn flush_stats(&self) -> RateResult<Option<HourlyStatsRow>> {
        self.flush_into(HourBucket::current()).await
    }

    /// Flush if `now` falls in a later hour than the current snapshot.
    pub async fn maybe_flush(&self, now: Timestamp) -> RateResult<Option<HourlyStatsRow>> {
        let next = HourBucket::of(now);
        if self.current.lock().bucket >= next {
            return Ok(None);
        }
        self.flush_into(next).await
    }

    /// Check every `interval` until `shutdown` flips, then flush once more.
    pub async fn run_flush_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.maybe_flush(now()).await {
                        warn!(error = %e, "Statistics flush failed, will retry");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.flush_stats().await {
            warn!(error = %e, "Final statistics flush failed");
        }
        info!("Monitor flush loop stopped");
    }

    async fn flush_into(&self, next: HourBucket) -> RateResult<Option<HourlyStatsRow>> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Statistics flush already in progress");
            return Ok(None);
        }

        let result = self.flush_locked(next).await;
        self.flushing.store(false, Ordering::Release);
        result
    }

    async fn flush_locked(&self, next: HourBucket) -> RateResult<Option<HourlyStatsRow>> {
        let taken = std::mem::replace(&mut *self.current.lock(), StatsSnapshot::new(next));
        if taken.total_queries == 0 {
            return Ok(None);
        }

        let row = taken.to_row();
        match self.store.insert_hourly_stats(&row).await {
            Ok(()) => {
                info!(
                    hour = %row.bucket,
                    total_queries = row.total_queries,
                    cache_hit_rate = row.cache_hit_rate,
                    avg_latency_ms = row.avg_latency_ms,
                    "Flushed hourly statistics"
                );
                Ok(Some(row))
            }
            Err(RateError::StatsAlreadyRecorded(bucket)) => {
                // The hour was flushed earlier (mid-hour flush or restart); its
                // remaining counts are dropped.
                warn!(
                    hour = %bucket,
                    dropped_queries = taken.total_queries,
                    "Statistics for this hour already recorded, discarding"
                );
                Ok(None)
            }
            Err(e) => {
                // Put the unsaved hour back; anything recorded meanwhile joins it.
                let mut current = self.current.lock();
                let newer = std::mem::replace(&mut *current, taken);
                current.absorb(&newer);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRateStore;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use ratemesh_common::CurrencyCode;

    use crate::cache::RateKey;
    use crate::store::{RateHistoryRecord, StoredRate};

    fn miss(latency_ms: f64) -> QueryOutcome {
        QueryOutcome {
            provider_called: true,
            latency_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_derived_stats() {
        let monitor = RateMonitor::new(Arc::new(MemoryRateStore::new()));
        for _ in 0..3 {
            monitor.record_query(QueryOutcome::cache_hit(10.0));
        }
        monitor.record_query(miss(100.0));

        let stats = monitor.get_current_stats();
        assert_eq!(stats.snapshot.total_queries, 4);
        assert_eq!(stats.cache_hit_rate, 75.0);
        assert_eq!(stats.avg_latency_ms, 32.5);
        assert_eq!(stats.provider_success_rate, 100.0);
    }

    #[test]
    fn test_empty_stats() {
        let monitor = RateMonitor::new(Arc::new(MemoryRateStore::new()));
        let stats = monitor.get_current_stats();
        assert_eq!(stats.cache_hit_rate, 0.0);
        assert_eq!(stats.provider_success_rate, 100.0);
        assert_eq!(stats.avg_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn test_flushes_once_per_hour() {
        let store = Arc::new(MemoryRateStore::new());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 15, 0).unwrap();
        let monitor = RateMonitor::starting_at(store.clone(), start);

        monitor.record_query(miss(40.0));
        monitor.record_query(QueryOutcome {
            provider_called: true,
            provider_failed: true,
            inferred: true,
            latency_ms: 60.0,
            ..Default::default()
        });

        // Same hour: nothing to do.
        let same_hour = monitor.maybe_flush(start + chrono::Duration::minutes(30)).await;
        assert!(same_hour.unwrap().is_none());

        let row = monitor
            .maybe_flush(start + chrono::Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.bucket.hour, 9);
        assert_eq!(row.provider_failures, 1);
        assert_eq!(row.inferred_rates, 1);
        assert_eq!(row.avg_latency_ms, 50.0);

        let stats = monitor.get_current_stats();
        assert_eq!(stats.snapshot.total_queries, 0);
        assert_eq!(stats.snapshot.bucket.hour, 10);

        let rows = store.hourly_stats(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    struct RejectingStore;

    #[async_trait]
    impl RateStore for RejectingStore {
        fn name(&self) -> &str {
            "rejecting"
        }
        async fn upsert_rates(&self, _rates: &[StoredRate]) -> RateResult<()> {
            Ok(())
        }
        async fn latest_rate(&self, _key: &RateKey) -> RateResult<Option<StoredRate>> {
            Ok(None)
        }
        async fn append_history(&self, _record: &RateHistoryRecord) -> RateResult<()> {
            Ok(())
        }
        async fn history(
            &self,
            _from: &CurrencyCode,
            _to: &CurrencyCode,
            _limit: usize,
        ) -> RateResult<Vec<RateHistoryRecord>> {
            Ok(Vec::new())
        }
        async fn insert_hourly_stats(&self, _row: &HourlyStatsRow) -> RateResult<()> {
            Err(RateError::Store("database unavailable".into()))
        }
        async fn hourly_stats(&self, _date: NaiveDate) -> RateResult<Vec<HourlyStatsRow>> {
            Ok(Vec::new())
        }
        async fn purge_rates_before(&self, _cutoff: NaiveDate) -> RateResult<u64> {
            Ok(0)
        }
        async fn purge_history_before(&self, _cutoff: NaiveDate) -> RateResult<u64> {
            Ok(0)
        }
        async fn purge_stats_before(&self, _cutoff: NaiveDate) -> RateResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_counters() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let monitor = RateMonitor::starting_at(Arc::new(RejectingStore), start);
        monitor.record_query(miss(20.0));

        assert!(monitor.maybe_flush(start + chrono::Duration::hours(1)).await.is_err());

        let stats = monitor.get_current_stats();
        assert_eq!(stats.snapshot.total_queries, 1);
        assert_eq!(stats.snapshot.bucket.hour, 9);
    }

    #[tokio::test]
    async fn test_already_recorded_hour_is_discarded() {
        let store = Arc::new(MemoryRateStore::new());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 13, 20, 0).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        // 13:00 was already flushed before this monitor started.
        let earlier = RateMonitor::starting_at(store.clone(), start);
        earlier.record_query(miss(10.0));
        earlier.maybe_flush(start + chrono::Duration::hours(1)).await.unwrap();

        let monitor = RateMonitor::starting_at(store.clone(), start);
        monitor.record_query(miss(30.0));
        assert!(monitor.maybe_flush(start + chrono::Duration::hours(1)).await.unwrap().is_none());

        let stats = monitor.get_current_stats();
        assert_eq!(stats.snapshot.total_queries, 0);
        assert_eq!(stats.snapshot.bucket.hour, 14);

        // Later hours keep flushing.
        monitor.record_query(miss(50.0));
        let row = monitor
            .maybe_flush(start + chrono::Duration::hours(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.bucket.hour, 14);
        assert_eq!(row.total_queries, 1);

        let rows = store.hourly_stats(date).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().find(|r| r.bucket.hour == 13).map(|r| r.avg_latency_ms), Some(10.0));
    }

    #[tokio::test]
    async fn test_flush_loop_stops_on_shutdown() {
        let store = Arc::new(MemoryRateStore::new());
        let monitor = Arc::new(RateMonitor::new(store));
        monitor.record_query(QueryOutcome::cache_hit(1.0));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.clone().run_flush_loop(Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // The final flush drained the snapshot.
        assert_eq!(monitor.get_current_stats().snapshot.total_queries, 0);
    }
}
