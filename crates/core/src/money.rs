//! Money primitives.
//!
//! Amounts are `rust_decimal::Decimal` with at most [`MONEY_SCALE`] fractional
//! digits. Multi-currency conversion is out of scope; the currency only travels
//! with the transaction.

use core::fmt;
use core::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Fractional digits persisted for every amount (`NUMERIC(20,2)`).
pub const MONEY_SCALE: u32 = 2;

/// Validate a transaction amount: strictly positive with at most two decimals.
pub fn validate_amount(amount: Decimal) -> DomainResult<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(DomainError::validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    if amount.normalize().scale() > MONEY_SCALE {
        return Err(DomainError::validation(format!(
            "amount {amount} has more than {MONEY_SCALE} fractional digits"
        )));
    }
    Ok(amount)
}

/// ISO-4217 style three letter currency code, stored upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::usd()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!(
                "currency must be a 3 letter code, got {s:?}"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for Currency {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}
