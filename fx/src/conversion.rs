//! Amount conversion at a resolved rate.

use ratemesh_common::{CurrencyCode, Timestamp};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RateError, RateResult};
use crate::orchestrator::RateQuoteResult;

/// A completed conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Unique conversion ID.
    pub id: Uuid,
    /// Input amount, in `from`.
    pub amount: Decimal,
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    /// Output amount rounded to the minor units of `to`.
    pub converted_amount: Decimal,
    pub rate: f64,
    pub provider_id: String,
    pub is_inferred: bool,
    pub path: Vec<CurrencyCode>,
    pub hops: usize,
    /// When the rate was obtained.
    pub timestamp: Timestamp,
}

impl ConversionResult {
    /// Apply a quote to an amount.
    pub fn from_quote(amount: f64, quote: &RateQuoteResult) -> RateResult<Self> {
        let input = validate_amount(amount)?;
        let converted_amount =
            convert_amount(input, quote.rate, &quote.to).ok_or(RateError::InvalidAmount(amount))?;

        Ok(Self {
            id: Uuid::now_v7(),
            amount: input,
            from: quote.from.clone(),
            to: quote.to.clone(),
            converted_amount,
            rate: quote.rate,
            provider_id: quote.provider_id.clone(),
            is_inferred: quote.is_inferred,
            path: quote.path.clone(),
            hops: quote.hops,
            timestamp: quote.timestamp,
        })
    }

    /// Rate implied by the rounded output.
    pub fn effective_rate(&self) -> Decimal {
        if self.amount.is_zero() {
            return Decimal::ZERO;
        }
        self.converted_amount / self.amount
    }
}

/// Accept finite, non-negative amounts that fit a decimal.
pub fn validate_amount(amount: f64) -> RateResult<Decimal> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(RateError::InvalidAmount(amount));
    }
    Decimal::from_f64(amount).ok_or(RateError::InvalidAmount(amount))
}

/// `amount * rate`, rounded to the minor units of `to`. `None` on overflow.
pub fn convert_amount(amount: Decimal, rate: f64, to: &CurrencyCode) -> Option<Decimal> {
    let rate = Decimal::from_f64(rate)?;
    amount
        .checked_mul(rate)
        .map(|value| value.round_dp(to.minor_units()))
}
