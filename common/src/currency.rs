//! Currency codes and the engine-wide validation policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CurrencyError;

/// Minimum accepted code length.
pub const MIN_CODE_LEN: usize = 3;

/// Maximum accepted code length.
pub const MAX_CODE_LEN: usize = 10;

/// Normalized currency identifier (ISO 4217 or a crypto ticker).
///
/// Codes are trimmed and uppercased on construction, so equality is
/// case-insensitive with respect to the caller's input. The set of codes is
/// open: any 3 to 10 character ASCII alphanumeric code starting with a
/// letter is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Parse and normalize a currency code.
    pub fn parse(code: &str) -> Result<Self, CurrencyError> {
        let normalized = code.trim().to_ascii_uppercase();

        if !Self::is_valid_format(&normalized) {
            return Err(CurrencyError::InvalidCode(code.to_string()));
        }

        Ok(Self(normalized))
    }

    fn is_valid_format(code: &str) -> bool {
        let len = code.len();
        (MIN_CODE_LEN..=MAX_CODE_LEN).contains(&len)
            && code.starts_with(|c: char| c.is_ascii_alphabetic())
            && code.chars().all(|c| c.is_ascii_alphanumeric())
    }

    /// Get the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Standard number of decimal places for amounts in this currency.
    pub fn minor_units(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
            "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
            "BTC" | "ETH" => 8,
            _ => 2,
        }
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn eur() -> Self {
        Self("EUR".to_string())
    }

    pub fn gbp() -> Self {
        Self("GBP".to_string())
    }

    pub fn jpy() -> Self {
        Self("JPY".to_string())
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CurrencyCode {
    type Err = CurrencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = CurrencyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for CurrencyCode {
    type Error = CurrencyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

impl AsRef<str> for CurrencyCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        let code = CurrencyCode::parse(" usd ").unwrap();
        assert_eq!(code.as_str(), "USD");
        assert_eq!(code, CurrencyCode::usd());
        assert_eq!(CurrencyCode::parse("eUr").unwrap(), CurrencyCode::parse("EUR").unwrap());
    }

    #[test]
    fn test_accepts_crypto_tickers() {
        assert!(CurrencyCode::parse("BTC").is_ok());
        assert!(CurrencyCode::parse("usdt").is_ok());
        assert!(CurrencyCode::parse("MATIC").is_ok());
    }

    #[test]
    fn test_rejects_malformed_codes() {
        assert!(CurrencyCode::parse("").is_err());
        assert!(CurrencyCode::parse("US").is_err());
        assert!(CurrencyCode::parse("1INCH").is_err());
        assert!(CurrencyCode::parse("US-D").is_err());
        assert!(CurrencyCode::parse("ABCDEFGHIJK").is_err());
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(CurrencyCode::jpy().minor_units(), 0);
        assert_eq!(CurrencyCode::parse("KWD").unwrap().minor_units(), 3);
        assert_eq!(CurrencyCode::usd().minor_units(), 2);
    }

    #[test]
    fn test_serde_validates() {
        let code: CurrencyCode = serde_json::from_str("\"gbp\"").unwrap();
        assert_eq!(code, CurrencyCode::gbp());
        assert!(serde_json::from_str::<CurrencyCode>("\"??\"").is_err());
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"GBP\"");
    }
}
