//! Rate engine error types.

use ratemesh_common::{CurrencyCode, CurrencyError, HourBucket};
use thiserror::Error;

/// Errors that can occur in the rate engine.
#[derive(Debug, Error)]
pub enum RateError {
    /// Currency code rejected at the boundary.
    #[error("Invalid currency code: {0}")]
    InvalidCurrencyCode(String),

    /// Every provider failed or returned nothing.
    #[error("All providers failed for {from}/{to}")]
    AllProvidersFailed { from: CurrencyCode, to: CurrencyCode },

    /// Providers answered but no path or direct quote connects the pair.
    #[error("No rate path from {from} to {to}")]
    RateNotFound { from: CurrencyCode, to: CurrencyCode },

    /// A single provider failed.
    #[error("Provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    /// A single provider exceeded its timeout.
    #[error("Provider {provider} timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    /// Cache backend failure.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// The append-only history could not be written.
    #[error("Failed to write rate history: {0}")]
    HistoryWriteFailed(String),

    /// A statistics row for this hour already exists.
    #[error("Statistics for {0} already recorded")]
    StatsAlreadyRecorded(HourBucket),

    /// Amount is negative or not finite.
    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    /// Plugin could not be built or failed.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl RateError {
    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        RateError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RateError::AllProvidersFailed { .. }
                | RateError::Provider { .. }
                | RateError::ProviderTimeout { .. }
                | RateError::Cache(_)
                | RateError::Store(_)
        )
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            RateError::InvalidCurrencyCode(_) => "INVALID_CURRENCY_CODE",
            RateError::AllProvidersFailed { .. } => "ALL_PROVIDERS_FAILED",
            RateError::RateNotFound { .. } => "RATE_NOT_FOUND",
            RateError::Provider { .. } => "PROVIDER_ERROR",
            RateError::ProviderTimeout { .. } => "PROVIDER_TIMEOUT",
            RateError::Cache(_) => "CACHE_ERROR",
            RateError::Store(_) => "STORE_ERROR",
            RateError::HistoryWriteFailed(_) => "HISTORY_WRITE_FAILED",
            RateError::StatsAlreadyRecorded(_) => "STATS_ALREADY_RECORDED",
            RateError::InvalidAmount(_) => "INVALID_AMOUNT",
            RateError::Plugin(_) => "PLUGIN_ERROR",
            RateError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

impl From<CurrencyError> for RateError {
    fn from(err: CurrencyError) -> Self {
        match err {
            CurrencyError::InvalidCode(code) => RateError::InvalidCurrencyCode(code),
        }
    }
}

impl From<sqlx::Error> for RateError {
    fn from(err: sqlx::Error) -> Self {
        RateError::Store(err.to_string())
    }
}

impl From<redis::RedisError> for RateError {
    fn from(err: redis::RedisError) -> Self {
        RateError::Cache(err.to_string())
    }
}

/// Result type for rate engine operations.
pub type RateResult<T> = Result<T, RateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_error_conversion() {
        let err: RateError = CurrencyCode::parse("x").unwrap_err().into();
        assert!(matches!(err, RateError::InvalidCurrencyCode(ref c) if c == "x"));
        assert_eq!(err.error_code(), "INVALID_CURRENCY_CODE");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(RateError::provider("ecb", "502").is_retryable());
        assert!(RateError::ProviderTimeout {
            provider: "ecb".into(),
            timeout_ms: 10_000
        }
        .is_retryable());
        assert!(!RateError::HistoryWriteFailed("disk".into()).is_retryable());
    }
}
