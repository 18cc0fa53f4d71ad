//! Batch REST feed provider.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use ratemesh_common::{today, CurrencyCode};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{filter_batch, ProviderDescriptor, RateBatch, RateProvider};
use crate::error::{RateError, RateResult};

/// Configuration for a JSON rate feed.
///
/// URL templates may contain `{base}`, `{symbols}` (comma separated) and
/// `{date}` (`YYYY-MM-DD`). Query parameters left empty after
/// substitution are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestProviderConfig {
    #[serde(flatten)]
    pub descriptor: ProviderDescriptor,
    /// e.g. `https://api.frankfurter.app/latest?from={base}&to={symbols}`
    pub latest_url: String,
    /// e.g. `https://api.frankfurter.app/{date}?from={base}&to={symbols}`
    #[serde(default)]
    pub historical_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_param")]
    pub api_key_param: String,
    /// Top-level field holding the `{CODE: rate}` object.
    #[serde(default = "default_rates_field")]
    pub rates_field: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_key_param() -> String {
    "access_key".to_string()
}

fn default_rates_field() -> String {
    "rates".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl RestProviderConfig {
    pub fn new(descriptor: ProviderDescriptor, latest_url: impl Into<String>) -> Self {
        Self {
            descriptor,
            latest_url: latest_url.into(),
            historical_url: None,
            api_key: None,
            api_key_param: default_api_key_param(),
            rates_field: default_rates_field(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Provider backed by an HTTP JSON endpoint.
pub struct RestRateProvider {
    config: RestProviderConfig,
    client: reqwest::Client,
}

impl RestRateProvider {
    /// Create a provider with its own HTTP client.
    pub fn new(config: RestProviderConfig) -> RateResult<Self> {
        if config.timeout_secs == 0 {
            return Err(RateError::Configuration(format!(
                "Provider {} timeout must be positive",
                config.descriptor.id
            )));
        }
        let sample = config
            .latest_url
            .replace("{base}", "USD")
            .replace("{symbols}", "")
            .replace("{date}", "2000-01-01");
        Url::parse(&sample).map_err(|e| {
            RateError::Configuration(format!(
                "Provider {} latest_url: {}",
                config.descriptor.id, e
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RateError::Configuration(e.to_string()))?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &RestProviderConfig {
        &self.config
    }

    /// Pick the template for `as_of` and fill it in.
    fn request_url(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<Url> {
        let historical = as_of.filter(|date| *date < today());

        let (template, date) = match historical {
            Some(date) => {
                let template = self.config.historical_url.as_deref().ok_or_else(|| {
                    RateError::provider(
                        &self.config.descriptor.id,
                        "historical rates not supported",
                    )
                })?;
                (template, date)
            }
            None => (self.config.latest_url.as_str(), today()),
        };

        let mut url = render_url(template, base, targets, date)
            .map_err(|e| RateError::provider(&self.config.descriptor.id, e))?;

        if let Some(key) = &self.config.api_key {
            url.query_pairs_mut().append_pair(&self.config.api_key_param, key);
        }
        Ok(url)
    }

    fn transport_error(&self, err: reqwest::Error) -> RateError {
        if err.is_timeout() {
            RateError::ProviderTimeout {
                provider: self.config.descriptor.id.clone(),
                timeout_ms: self.config.timeout().as_millis() as u64,
            }
        } else {
            RateError::provider(&self.config.descriptor.id, err.to_string())
        }
    }

    async fn get_json(&self, url: Url) -> RateResult<Value> {
        debug!(
            provider = %self.config.descriptor.id,
            url = %redact(&url, &self.config.api_key_param),
            "Requesting rates"
        );

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RateError::provider(
                &self.config.descriptor.id,
                format!("HTTP {}", status),
            ));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                RateError::provider(
                    &self.config.descriptor.id,
                    format!("malformed response: {}", e),
                )
            }
        })
    }
}

#[async_trait]
impl RateProvider for RestRateProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        self.config.descriptor.clone()
    }

    async fn fetch_rates(
        &self,
        base: &CurrencyCode,
        targets: &BTreeSet<CurrencyCode>,
        as_of: Option<NaiveDate>,
    ) -> RateResult<RateBatch> {
        if !self.config.descriptor.supports(base) {
            return Ok(RateBatch::new());
        }

        let url = self.request_url(base, targets, as_of)?;
        let body = self.get_json(url).await?;
        let raw = parse_rates(&body, &self.config.rates_field)
            .map_err(|e| RateError::provider(&self.config.descriptor.id, e))?;

        Ok(filter_batch(raw, base, targets, &self.config.descriptor))
    }

    async fn test_connection(&self) -> RateResult<()> {
        let base = self
            .config
            .descriptor
            .supported_currencies
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(CurrencyCode::usd);
        let url = self.request_url(&base, &BTreeSet::new(), None)?;
        self.get_json(url).await.map(|_| ())
    }
}

/// Fill a URL template and drop query parameters left empty.
pub fn render_url(
    template: &str,
    base: &CurrencyCode,
    targets: &BTreeSet<CurrencyCode>,
    date: NaiveDate,
) -> Result<Url, String> {
    let symbols = targets
        .iter()
        .map(CurrencyCode::as_str)
        .collect::<Vec<_>>()
        .join(",");

    let filled = template
        .replace("{base}", base.as_str())
        .replace("{symbols}", &symbols)
        .replace("{date}", &date.format("%Y-%m-%d").to_string());

    let mut url = Url::parse(&filled).map_err(|e| format!("invalid url {:?}: {}", filled, e))?;

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    Ok(url)
}

/// Extract `{CODE: rate}` from a response body.
///
/// Numbers and numeric strings are accepted; codes that fail validation
/// or values that do not parse are skipped.
pub fn parse_rates(body: &Value, field: &str) -> Result<Vec<(CurrencyCode, f64)>, String> {
    let rates = body
        .get(field)
        .and_then(Value::as_object)
        .ok_or_else(|| format!("response has no {:?} object", field))?;

    let mut parsed = Vec::with_capacity(rates.len());
    for (code, value) in rates {
        let rate = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };

        match (CurrencyCode::parse(code), rate) {
            (Ok(code), Some(rate)) => parsed.push((code, rate)),
            _ => warn!(code = %code, value = %value, "Skipping unparseable rate"),
        }
    }
    Ok(parsed)
}

fn redact(url: &Url, secret_param: &str) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == secret_param { "***".into() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    if !pairs.is_empty() {
        shown.query_pairs_mut().clear().extend_pairs(pairs);
    }
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code(s: &str) -> CurrencyCode {
        CurrencyCode::parse(s).unwrap()
    }

    fn provider(historical: Option<&str>) -> RestRateProvider {
        let mut config = RestProviderConfig::new(
            ProviderDescriptor::new("frankfurter", "Frankfurter", 1),
            "https://api.example.com/latest?from={base}&to={symbols}",
        );
        config.historical_url = historical.map(str::to_string);
        config.api_key = Some("secret".into());
        RestRateProvider::new(config).unwrap()
    }

    #[test]
    fn test_render_url() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let targets = BTreeSet::from([code("GBP"), code("EUR")]);

        let template = "https://x.test/{date}?from={base}&to={symbols}";
        let url = render_url(template, &code("usd"), &targets, date).unwrap();
        assert_eq!(url.path(), "/2024-02-29");
        let pairs: Vec<_> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs, vec![("from".into(), "USD".into()), ("to".into(), "EUR,GBP".into())]);

        let template = "https://x.test/latest?from={base}&to={symbols}";
        let all = render_url(template, &code("USD"), &BTreeSet::new(), date).unwrap();
        assert_eq!(all.query(), Some("from=USD"));
    }

    #[test]
    fn test_parse_rates() {
        let body = json!({
            "base": "USD",
            "rates": { "EUR": 0.92, "GBP": "0.79", "??": 1.0, "JPY": null }
        });

        let mut parsed = parse_rates(&body, "rates").unwrap();
        parsed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(parsed, vec![(code("EUR"), 0.92), (code("GBP"), 0.79)]);

        assert!(parse_rates(&json!({"data": {}}), "rates").is_err());
    }

    #[test]
    fn test_request_url_selects_template() {
        let p = provider(Some("https://api.example.com/{date}?from={base}"));
        let targets = BTreeSet::from([code("EUR")]);

        let latest = p.request_url(&code("USD"), &targets, None).unwrap();
        assert!(latest.path().ends_with("/latest"));
        assert!(latest.query().unwrap().contains("access_key=secret"));

        let past = NaiveDate::from_ymd_opt(2020, 5, 4).unwrap();
        let historical = p.request_url(&code("USD"), &targets, Some(past)).unwrap();
        assert_eq!(historical.path(), "/2020-05-04");

        let no_history = provider(None);
        assert!(no_history.request_url(&code("USD"), &targets, Some(past)).is_err());
        // Today falls back to the latest endpoint.
        assert!(no_history.request_url(&code("USD"), &targets, Some(today())).is_ok());
    }

    #[test]
    fn test_redact_hides_key() {
        let p = provider(None);
        let url = p.request_url(&code("USD"), &BTreeSet::new(), None).unwrap();
        let shown = redact(&url, "access_key");
        assert!(!shown.contains("secret"));
        assert!(shown.contains("access_key=***"));
    }

    #[test]
    fn test_rejects_bad_config() {
        let mut config =
            RestProviderConfig::new(ProviderDescriptor::new("bad", "Bad", 1), "not a url");
        assert!(RestRateProvider::new(config.clone()).is_err());
        config.latest_url = "https://ok.test/latest".into();
        config.timeout_secs = 0;
        assert!(RestRateProvider::new(config).is_err());
    }

    #[tokio::test]
    async fn test_unsupported_base_is_empty() {
        let mut config = RestProviderConfig::new(
            ProviderDescriptor::new("ecb", "ECB", 1).with_currencies([code("EUR"), code("USD")]),
            "http://127.0.0.1:9/latest?from={base}",
        );
        config.timeout_secs = 1;
        let p = RestRateProvider::new(config).unwrap();

        let batch = p.fetch_rates(&code("JPY"), &BTreeSet::new(), None).await.unwrap();
        assert!(batch.is_empty());
    }
}
