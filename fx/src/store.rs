//! Durable rate persistence.
//!
//! Three independent tables:
//!
//! - **rates**: latest known rate per `(from, to, date)`, upserted on every
//!   successful fetch. Safe to lose; purged after a week.
//! - **history**: one immutable record per resolved query. The authoritative
//!   record of which rate was used, and how it was obtained.
//! - **hourly stats**: one row per `(date, hour)`, written once by the
//!   monitor flush.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use parking_lot::RwLock;
use ratemesh_common::{now, retention, CurrencyCode, HourBucket, Timestamp};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::RateKey;
use crate::error::{RateError, RateResult};

/// Row of the renewable rates table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRate {
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub date: NaiveDate,
    pub rate: f64,
    pub provider_id: String,
    pub fetched_at: Timestamp,
}

impl StoredRate {
    pub fn key(&self) -> RateKey {
        RateKey::new(self.from.clone(), self.to.clone(), self.date)
    }
}

/// Immutable record of one resolved query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateHistoryRecord {
    pub id: Uuid,
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    /// Day the rate applies to.
    pub date: NaiveDate,
    pub rate: f64,
    pub provider_id: String,
    pub is_inferred: bool,
    pub hops: usize,
    pub path: Vec<CurrencyCode>,
    pub recorded_at: Timestamp,
    /// Correlation id of the request that resolved the rate, when known.
    pub correlation_id: Option<String>,
}

/// Persisted hourly monitor snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyStatsRow {
    pub bucket: HourBucket,
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub provider_calls: u64,
    pub provider_failures: u64,
    pub inferred_rates: u64,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: f64,
}

/// Persistence for rates, history and statistics.
#[async_trait]
pub trait RateStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or replace rows keyed by `(from, to, date)`.
    async fn upsert_rates(&self, rates: &[StoredRate]) -> RateResult<()>;

    async fn latest_rate(&self, key: &RateKey) -> RateResult<Option<StoredRate>>;

    /// Append a history record. Failures are [`RateError::HistoryWriteFailed`].
    async fn append_history(&self, record: &RateHistoryRecord) -> RateResult<()>;

    /// Most recent history for a pair, newest first.
    async fn history(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        limit: usize,
    ) -> RateResult<Vec<RateHistoryRecord>>;

    /// Insert an hourly row. A second row for the same hour is rejected.
    async fn insert_hourly_stats(&self, row: &HourlyStatsRow) -> RateResult<()>;

    /// Hourly rows for one day, ordered by hour.
    async fn hourly_stats(&self, date: NaiveDate) -> RateResult<Vec<HourlyStatsRow>>;

    /// Delete rate rows dated before `cutoff`. Returns the number removed.
    async fn purge_rates_before(&self, cutoff: NaiveDate) -> RateResult<u64>;

    async fn purge_history_before(&self, cutoff: NaiveDate) -> RateResult<u64>;

    async fn purge_stats_before(&self, cutoff: NaiveDate) -> RateResult<u64>;
}

/// Shared store handle.
pub type SharedRateStore = Arc<dyn RateStore>;

/// In-process store for tests and single-node deployments without a database.
#[derive(Default)]
pub struct MemoryRateStore {
    rates: RwLock<HashMap<RateKey, StoredRate>>,
    history: RwLock<Vec<RateHistoryRecord>>,
    stats: RwLock<BTreeMap<HourBucket, HourlyStatsRow>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_count(&self) -> usize {
        self.rates.read().len()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert_rates(&self, rates: &[StoredRate]) -> RateResult<()> {
        let mut table = self.rates.write();
        for rate in rates {
            table.insert(rate.key(), rate.clone());
        }
        Ok(())
    }

    async fn latest_rate(&self, key: &RateKey) -> RateResult<Option<StoredRate>> {
        Ok(self.rates.read().get(key).cloned())
    }

    async fn append_history(&self, record: &RateHistoryRecord) -> RateResult<()> {
        self.history.write().push(record.clone());
        Ok(())
    }

    async fn history(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        limit: usize,
    ) -> RateResult<Vec<RateHistoryRecord>> {
        let history = self.history.read();
        Ok(history
            .iter()
            .rev()
            .filter(|r| &r.from == from && &r.to == to)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_hourly_stats(&self, row: &HourlyStatsRow) -> RateResult<()> {
        let mut stats = self.stats.write();
        if stats.contains_key(&row.bucket) {
            return Err(RateError::StatsAlreadyRecorded(row.bucket));
        }
        stats.insert(row.bucket, row.clone());
        Ok(())
    }

    async fn hourly_stats(&self, date: NaiveDate) -> RateResult<Vec<HourlyStatsRow>> {
        Ok(self
            .stats
            .read()
            .values()
            .filter(|row| row.bucket.date == date)
            .cloned()
            .collect())
    }

    async fn purge_rates_before(&self, cutoff: NaiveDate) -> RateResult<u64> {
        let mut rates = self.rates.write();
        let before = rates.len();
        rates.retain(|key, _| key.date >= cutoff);
        Ok((before - rates.len()) as u64)
    }

    async fn purge_history_before(&self, cutoff: NaiveDate) -> RateResult<u64> {
        let mut history = self.history.write();
        let before = history.len();
        history.retain(|r| r.recorded_at.date_naive() >= cutoff);
        Ok((before - history.len()) as u64)
    }

    async fn purge_stats_before(&self, cutoff: NaiveDate) -> RateResult<u64> {
        let mut stats = self.stats.write();
        let before = stats.len();
        stats.retain(|bucket, _| bucket.date >= cutoff);
        Ok((before - stats.len()) as u64)
    }
}

/// PostgreSQL store.
pub struct PgRateStore {
    pool: PgPool,
}

impl PgRateStore {
    /// Connect with a small pool.
    pub async fn connect(database_url: &str) -> RateResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        info!("Rate store connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> RateResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RateError::Store(e.to_string()))?;

        info!("Rate store migrations applied");
        Ok(())
    }
}

fn to_decimal(rate: f64) -> RateResult<Decimal> {
    Decimal::from_f64(rate)
        .ok_or_else(|| RateError::Store(format!("Rate {} is not representable", rate)))
}

fn from_decimal(value: Decimal) -> RateResult<f64> {
    value
        .to_f64()
        .ok_or_else(|| RateError::Store(format!("Stored rate {} is out of range", value)))
}

fn column_code(row: &PgRow, column: &str) -> RateResult<CurrencyCode> {
    let raw: String = row.try_get(column)?;
    Ok(CurrencyCode::parse(&raw)?)
}

fn stored_rate_from_row(row: &PgRow) -> RateResult<StoredRate> {
    Ok(StoredRate {
        from: column_code(row, "from_currency")?,
        to: column_code(row, "to_currency")?,
        date: row.try_get("rate_date")?,
        rate: from_decimal(row.try_get("rate")?)?,
        provider_id: row.try_get("provider_id")?,
        fetched_at: row.try_get("fetched_at")?,
    })
}

fn history_from_row(row: &PgRow) -> RateResult<RateHistoryRecord> {
    let path: Vec<String> = row.try_get("path")?;
    let hops: i32 = row.try_get("hops")?;

    Ok(RateHistoryRecord {
        id: row.try_get("id")?,
        from: column_code(row, "from_currency")?,
        to: column_code(row, "to_currency")?,
        date: row.try_get("rate_date")?,
        rate: from_decimal(row.try_get("rate")?)?,
        provider_id: row.try_get("provider_id")?,
        is_inferred: row.try_get("is_inferred")?,
        hops: hops.max(0) as usize,
        path: path
            .iter()
            .map(|c| CurrencyCode::parse(c))
            .collect::<Result<_, _>>()?,
        recorded_at: row.try_get("recorded_at")?,
        correlation_id: row.try_get("correlation_id")?,
    })
}

fn stats_from_row(row: &PgRow) -> RateResult<HourlyStatsRow> {
    let hour: i32 = row.try_get("hour")?;
    let count = |column: &str| -> RateResult<u64> {
        let value: i64 = row.try_get(column)?;
        Ok(value.max(0) as u64)
    };

    Ok(HourlyStatsRow {
        bucket: HourBucket {
            date: row.try_get("stat_date")?,
            hour: hour.clamp(0, 23) as u32,
        },
        total_queries: count("total_queries")?,
        cache_hits: count("cache_hits")?,
        cache_misses: count("cache_misses")?,
        provider_calls: count("provider_calls")?,
        provider_failures: count("provider_failures")?,
        inferred_rates: count("inferred_rates")?,
        cache_hit_rate: row.try_get("cache_hit_rate")?,
        avg_latency_ms: row.try_get("avg_latency_ms")?,
    })
}

#[async_trait]
impl RateStore for PgRateStore {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn upsert_rates(&self, rates: &[StoredRate]) -> RateResult<()> {
        let mut tx = self.pool.begin().await?;

        for rate in rates {
            sqlx::query(
                r#"
                INSERT INTO exchange_rates
                    (from_currency, to_currency, rate_date, rate, provider_id, fetched_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (from_currency, to_currency, rate_date)
                DO UPDATE SET rate = EXCLUDED.rate,
                              provider_id = EXCLUDED.provider_id,
                              fetched_at = EXCLUDED.fetched_at
                "#,
            )
            .bind(rate.from.as_str())
            .bind(rate.to.as_str())
            .bind(rate.date)
            .bind(to_decimal(rate.rate)?)
            .bind(&rate.provider_id)
            .bind(rate.fetched_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = rates.len(), "Upserted rates");
        Ok(())
    }

    async fn latest_rate(&self, key: &RateKey) -> RateResult<Option<StoredRate>> {
        let row = sqlx::query(
            r#"
            SELECT from_currency, to_currency, rate_date, rate, provider_id, fetched_at
            FROM exchange_rates
            WHERE from_currency = $1 AND to_currency = $2 AND rate_date = $3
            "#,
        )
        .bind(key.from.as_str())
        .bind(key.to.as_str())
        .bind(key.date)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(stored_rate_from_row).transpose()
    }

    async fn append_history(&self, record: &RateHistoryRecord) -> RateResult<()> {
        let path: Vec<String> = record.path.iter().map(|c| c.to_string()).collect();

        sqlx::query(
            r#"
            INSERT INTO rate_history
                (id, from_currency, to_currency, rate_date, rate, provider_id,
                 is_inferred, hops, path, recorded_at, correlation_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.id)
        .bind(record.from.as_str())
        .bind(record.to.as_str())
        .bind(record.date)
        .bind(to_decimal(record.rate).map_err(|e| RateError::HistoryWriteFailed(e.to_string()))?)
        .bind(&record.provider_id)
        .bind(record.is_inferred)
        .bind(record.hops as i32)
        .bind(&path)
        .bind(record.recorded_at)
        .bind(&record.correlation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RateError::HistoryWriteFailed(e.to_string()))?;

        Ok(())
    }

    async fn history(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        limit: usize,
    ) -> RateResult<Vec<RateHistoryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, from_currency, to_currency, rate_date, rate, provider_id,
                   is_inferred, hops, path, recorded_at, correlation_id
            FROM rate_history
            WHERE from_currency = $1 AND to_currency = $2
            ORDER BY recorded_at DESC
            LIMIT $3
            "#,
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    async fn insert_hourly_stats(&self, row: &HourlyStatsRow) -> RateResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO rate_stats_hourly
                (stat_date, hour, total_queries, cache_hits, cache_misses, provider_calls,
                 provider_failures, inferred_rates, cache_hit_rate, avg_latency_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (stat_date, hour) DO NOTHING
            "#,
        )
        .bind(row.bucket.date)
        .bind(row.bucket.hour as i32)
        .bind(row.total_queries as i64)
        .bind(row.cache_hits as i64)
        .bind(row.cache_misses as i64)
        .bind(row.provider_calls as i64)
        .bind(row.provider_failures as i64)
        .bind(row.inferred_rates as i64)
        .bind(row.cache_hit_rate)
        .bind(row.avg_latency_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RateError::StatsAlreadyRecorded(row.bucket));
        }
        Ok(())
    }

    async fn hourly_stats(&self, date: NaiveDate) -> RateResult<Vec<HourlyStatsRow>> {
        let rows = sqlx::query(
            r#"
            SELECT stat_date, hour, total_queries, cache_hits, cache_misses, provider_calls,
                   provider_failures, inferred_rates, cache_hit_rate, avg_latency_ms
            FROM rate_stats_hourly
            WHERE stat_date = $1
            ORDER BY hour
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stats_from_row).collect()
    }

    async fn purge_rates_before(&self, cutoff: NaiveDate) -> RateResult<u64> {
        let result = sqlx::query("DELETE FROM exchange_rates WHERE rate_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_history_before(&self, cutoff: NaiveDate) -> RateResult<u64> {
        let result = sqlx::query("DELETE FROM rate_history WHERE recorded_at < $1::date")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_stats_before(&self, cutoff: NaiveDate) -> RateResult<u64> {
        let result = sqlx::query("DELETE FROM rate_stats_hourly WHERE stat_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// How long each table keeps its rows, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub rates_days: i64,
    pub history_days: i64,
    pub stats_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            rates_days: retention::RATES_DAYS,
            history_days: retention::HISTORY_DAYS,
            stats_days: retention::STATS_DAYS,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> RateResult<()> {
        if self.rates_days < 1 || self.stats_days < 1 {
            return Err(RateError::Configuration(
                "Retention windows must be at least one day".into(),
            ));
        }
        if self.history_days < retention::MIN_HISTORY_DAYS {
            return Err(RateError::Configuration(format!(
                "Rate history must be kept at least {} days, got {}",
                retention::MIN_HISTORY_DAYS,
                self.history_days
            )));
        }
        Ok(())
    }
}

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub rates: u64,
    pub history: u64,
    pub stats: u64,
}

/// Apply `policy` relative to `today`.
pub async fn run_retention(
    store: &dyn RateStore,
    policy: &RetentionPolicy,
    today: NaiveDate,
) -> RateResult<RetentionReport> {
    policy.validate()?;

    let report = RetentionReport {
        rates: store.purge_rates_before(today - Duration::days(policy.rates_days)).await?,
        history: store.purge_history_before(today - Duration::days(policy.history_days)).await?,
        stats: store.purge_stats_before(today - Duration::days(policy.stats_days)).await?,
    };

    info!(
        store = store.name(),
        rates = report.rates,
        history = report.history,
        stats = report.stats,
        "Retention pass complete"
    );
    Ok(report)
}

/// Build a history record stamped now.
pub fn history_record(
    from: &CurrencyCode,
    to: &CurrencyCode,
    date: NaiveDate,
    rate: f64,
    provider_id: &str,
    path: Vec<CurrencyCode>,
    correlation_id: Option<String>,
) -> RateHistoryRecord {
    let hops = path.len().saturating_sub(1);
    RateHistoryRecord {
        id: Uuid::now_v7(),
        from: from.clone(),
        to: to.clone(),
        date,
        rate,
        provider_id: provider_id.to_string(),
        is_inferred: hops > 1,
        hops,
        path,
        recorded_at: now(),
        correlation_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> CurrencyCode {
        CurrencyCode::parse(s).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn stored(from: &str, to: &str, date: NaiveDate, rate: f64) -> StoredRate {
        StoredRate {
            from: code(from),
            to: code(to),
            date,
            rate,
            provider_id: "p1".into(),
            fetched_at: now(),
        }
    }

    fn stats_row(date: NaiveDate, hour: u32) -> HourlyStatsRow {
        HourlyStatsRow {
            bucket: HourBucket { date, hour },
            total_queries: 4,
            cache_hits: 3,
            cache_misses: 1,
            provider_calls: 1,
            provider_failures: 0,
            inferred_rates: 0,
            cache_hit_rate: 75.0,
            avg_latency_ms: 32.5,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_key() {
        let store = MemoryRateStore::new();
        let date = day(2024, 5, 1);

        store.upsert_rates(&[stored("USD", "EUR", date, 0.92)]).await.unwrap();
        store
            .upsert_rates(&[stored("USD", "EUR", date, 0.93), stored("USD", "GBP", date, 0.79)])
            .await
            .unwrap();

        assert_eq!(store.rate_count(), 2);
        let latest = store
            .latest_rate(&RateKey::new(code("USD"), code("EUR"), date))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.rate, 0.93);
    }

    #[tokio::test]
    async fn test_history_is_append_only_newest_first() {
        let store = MemoryRateStore::new();
        let date = day(2024, 5, 1);

        for rate in [0.91, 0.92, 0.93] {
            let path = vec![code("USD"), code("EUR")];
            let record = history_record(&code("USD"), &code("EUR"), date, rate, "p1", path, None);
            store.append_history(&record).await.unwrap();
        }
        let inferred = history_record(
            &code("EUR"),
            &code("GBP"),
            date,
            0.8587,
            "p1",
            vec![code("EUR"), code("USD"), code("GBP")],
            Some("corr-1".into()),
        );
        store.append_history(&inferred).await.unwrap();

        let history = store.history(&code("USD"), &code("EUR"), 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].rate, 0.93);
        assert!(!history[0].is_inferred);

        let cross = store.history(&code("EUR"), &code("GBP"), 10).await.unwrap();
        assert_eq!(cross[0].hops, 2);
        assert!(cross[0].is_inferred);
        assert_eq!(store.history_len(), 4);
    }

    #[tokio::test]
    async fn test_hourly_stats_written_once() {
        let store = MemoryRateStore::new();
        let date = day(2024, 5, 1);

        store.insert_hourly_stats(&stats_row(date, 14)).await.unwrap();
        store.insert_hourly_stats(&stats_row(date, 9)).await.unwrap();
        assert!(matches!(
            store.insert_hourly_stats(&stats_row(date, 14)).await,
            Err(RateError::StatsAlreadyRecorded(_))
        ));

        let rows = store.hourly_stats(date).await.unwrap();
        let hours: Vec<u32> = rows.iter().map(|r| r.bucket.hour).collect();
        assert_eq!(hours, vec![9, 14]);
    }

    #[tokio::test]
    async fn test_retention_purges_by_table() {
        let store = MemoryRateStore::new();
        let today = day(2024, 6, 30);

        let stale = today - Duration::days(8);
        store
            .upsert_rates(&[stored("USD", "EUR", today, 0.92), stored("USD", "EUR", stale, 0.9)])
            .await
            .unwrap();
        store.insert_hourly_stats(&stats_row(today, 1)).await.unwrap();
        store.insert_hourly_stats(&stats_row(today - Duration::days(31), 1)).await.unwrap();
        let path = vec![code("USD"), code("EUR")];
        let record = history_record(&code("USD"), &code("EUR"), today, 0.92, "p1", path, None);
        store.append_history(&record).await.unwrap();

        let report = run_retention(&store, &RetentionPolicy::default(), today).await.unwrap();
        assert_eq!(report, RetentionReport { rates: 1, history: 0, stats: 1 });
        assert_eq!(store.rate_count(), 1);
        assert_eq!(store.history_len(), 1);
    }

    #[test]
    fn test_retention_policy_validation() {
        assert!(RetentionPolicy::default().validate().is_ok());

        let short_history = RetentionPolicy {
            history_days: 7,
            ..Default::default()
        };
        assert!(matches!(short_history.validate(), Err(RateError::Configuration(_))));
    }

    #[test]
    fn test_decimal_conversion() {
        let d = to_decimal(0.8587).unwrap();
        assert!((from_decimal(d).unwrap() - 0.8587).abs() < 1e-12);
        assert!(to_decimal(f64::NAN).is_err());
    }
}
