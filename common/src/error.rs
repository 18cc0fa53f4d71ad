//! Error types shared across RateMesh crates.

use thiserror::Error;

/// Errors raised while validating currency input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CurrencyError {
    /// Code does not satisfy the currency code format.
    #[error("Invalid currency code: {0:?}")]
    InvalidCode(String),
}
